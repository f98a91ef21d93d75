//! SkyRelay core: configuration and error types shared by the relay binary.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigValidator, RelayConfig, StoreConfig};
pub use error::{DomainError, InfraError, SkyRelayError};
