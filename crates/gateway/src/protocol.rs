// Relay WebSocket Protocol
//
// Every text frame carries one named event: {"event": "<name>", "data": <payload>}.
// Names match the ones browser clients already use ("chat message", "kill user", ...).

use crate::session::{ConnectionId, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use skyrelay_store::{Fields, StoreEnvelope, StoreRequest};

/// Event sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "register")]
    Register(RegisterParams),

    #[serde(rename = "chat message")]
    ChatMessage(String),

    /// Courier reports whether they are currently flying a drone
    #[serde(rename = "drone status")]
    DroneStatus(bool),

    #[serde(rename = "create order")]
    CreateOrder(Fields),

    #[serde(rename = "update order")]
    UpdateOrder(Fields),

    #[serde(rename = "get all orders")]
    GetAllOrders,

    #[serde(rename = "create drone")]
    CreateDrone(Fields),

    #[serde(rename = "update drone")]
    UpdateDrone(Fields),

    #[serde(rename = "get all drones")]
    GetAllDrones,

    #[serde(rename = "kill user")]
    KillUser(KillParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterParams {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillParams {
    pub username: String,
}

/// Event sent by the relay to one or all clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat message")]
    ChatMessage(ChatMessageEvent),

    #[serde(rename = "courier issue")]
    CourierIssue(CourierIssueEvent),

    #[serde(rename = "order created")]
    OrderCreated(StoreEnvelope),

    #[serde(rename = "order updated")]
    OrderUpdated(StoreEnvelope),

    #[serde(rename = "all orders")]
    AllOrders(StoreEnvelope),

    #[serde(rename = "drone created")]
    DroneCreated(StoreEnvelope),

    #[serde(rename = "drone updated")]
    DroneUpdated(StoreEnvelope),

    #[serde(rename = "all drones")]
    AllDrones(StoreEnvelope),

    #[serde(rename = "kill result")]
    KillResult(KillResultEvent),

    #[serde(rename = "protocol error")]
    Error(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessageEvent {
    /// Connection that sent the message
    pub id: ConnectionId,
    pub message: String,
}

/// Alert broadcast when a courier drops while flying
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierIssueEvent {
    pub username: String,
    pub message: String,
}

impl CourierIssueEvent {
    pub fn connection_lost(username: &str) -> Self {
        Self {
            username: username.to_string(),
            message: format!(
                "Courier {} lost connection while operating a drone. Their orders are being returned to storage.",
                username
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillResultEvent {
    pub ok: bool,
    pub username: String,
    pub message: String,
}

impl KillResultEvent {
    pub fn succeeded(username: &str) -> Self {
        Self {
            ok: true,
            username: username.to_string(),
            message: format!("Connection for {} closed", username),
        }
    }

    pub fn failed(username: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            username: username.to_string(),
            message: message.into(),
        }
    }
}

/// Protocol error type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl ProtocolError {
    pub const INVALID_REQUEST: &'static str = "INVALID_REQUEST";
    pub const NOT_FOUND: &'static str = "NOT_FOUND";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

/// Store operations a client can ask the relay to perform on its behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    CreateOrder,
    UpdateOrder,
    GetAllOrders,
    CreateDrone,
    UpdateDrone,
    GetAllDrones,
}

impl ProxyKind {
    /// Build the store request; listing operations ignore `fields`.
    pub fn request(self, fields: Fields) -> StoreRequest {
        match self {
            Self::CreateOrder => StoreRequest::create_order(fields),
            Self::UpdateOrder => StoreRequest::update_order(fields),
            Self::GetAllOrders => StoreRequest::GetAllOrders,
            Self::CreateDrone => StoreRequest::create_drone(fields),
            Self::UpdateDrone => StoreRequest::update_drone(fields),
            Self::GetAllDrones => StoreRequest::GetAllDrones,
        }
    }

    /// Wrap the store's answer in the result event for this operation
    pub fn result_event(self, envelope: StoreEnvelope) -> ServerEvent {
        match self {
            Self::CreateOrder => ServerEvent::OrderCreated(envelope),
            Self::UpdateOrder => ServerEvent::OrderUpdated(envelope),
            Self::GetAllOrders => ServerEvent::AllOrders(envelope),
            Self::CreateDrone => ServerEvent::DroneCreated(envelope),
            Self::UpdateDrone => ServerEvent::DroneUpdated(envelope),
            Self::GetAllDrones => ServerEvent::AllDrones(envelope),
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            Self::CreateOrder => "create order",
            Self::UpdateOrder => "update order",
            Self::GetAllOrders => "get all orders",
            Self::CreateDrone => "create drone",
            Self::UpdateDrone => "update drone",
            Self::GetAllDrones => "get all drones",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_frame() {
        let frame = r#"{"event":"register","data":{"username":"u1","role":"courier"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::Register(RegisterParams {
                username: "u1".to_string(),
                role: Role::Courier,
            })
        );
    }

    #[test]
    fn test_frames_with_scalar_payloads() {
        let chat: ClientEvent =
            serde_json::from_str(r#"{"event":"chat message","data":"hello"}"#).unwrap();
        assert_eq!(chat, ClientEvent::ChatMessage("hello".to_string()));

        let status: ClientEvent =
            serde_json::from_str(r#"{"event":"drone status","data":true}"#).unwrap();
        assert_eq!(status, ClientEvent::DroneStatus(true));
    }

    #[test]
    fn test_listing_frame_without_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"get all orders"}"#).unwrap();
        assert_eq!(event, ClientEvent::GetAllOrders);
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        // unknown role
        assert!(serde_json::from_str::<ClientEvent>(
            r#"{"event":"register","data":{"username":"u1","role":"pilot"}}"#
        )
        .is_err());
        // order fields must be an object
        assert!(
            serde_json::from_str::<ClientEvent>(r#"{"event":"create order","data":[1,2]}"#)
                .is_err()
        );
        // unknown event name
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"launch","data":{}}"#).is_err());
    }

    #[test]
    fn test_server_event_names() {
        let event = ServerEvent::ChatMessage(ChatMessageEvent {
            id: ConnectionId::from("c-1"),
            message: "hi".to_string(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"event": "chat message", "data": {"id": "c-1", "message": "hi"}}));

        let value =
            serde_json::to_value(ServerEvent::KillResult(KillResultEvent::failed("ghost", "nope")))
                .unwrap();
        assert_eq!(value["event"], "kill result");
        assert_eq!(value["data"]["ok"], false);
    }

    #[test]
    fn test_proxy_kind_mapping() {
        let mut fields = Fields::new();
        fields.insert("order_id".to_string(), json!(3));

        assert_eq!(
            ProxyKind::UpdateOrder.request(fields.clone()),
            StoreRequest::update_order(fields.clone())
        );
        assert_eq!(ProxyKind::GetAllDrones.request(fields), StoreRequest::GetAllDrones);

        let envelope = StoreEnvelope::error("down");
        let value = serde_json::to_value(ProxyKind::CreateOrder.result_event(envelope)).unwrap();
        assert_eq!(value["event"], "order created");
        assert_eq!(value["data"]["status"], "error");
    }
}
