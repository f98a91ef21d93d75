// SkyRelay Gateway - real-time session coordinator
//
// WebSocket relay between customers and couriers: tracks who is connected,
// fans out chat and courier alerts, proxies order/drone operations to the
// remote store, and recovers a courier's orders when they drop mid-flight.

pub mod coordinator;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use coordinator::SessionCoordinator;
pub use presence::PresenceRegistry;
pub use protocol::*;
pub use server::RelayServer;
pub use session::{Connection, ConnectionId, ConnectionState, ConnectionTable, Role};
pub use transport::{ChannelTransport, Directive, Transport};
