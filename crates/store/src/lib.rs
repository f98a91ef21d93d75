//! Client for the remote order/drone store.
//!
//! The store is a single JSON endpoint: every request is a POST whose body
//! carries a `type` discriminator, and every response is wrapped in a
//! `{status, timestamp, data}` envelope.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request error: {0}")]
    Request(String),
    #[error("store returned HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Error envelope from the body, when the store sent one
        envelope: Option<StoreEnvelope>,
    },
    #[error("store rejected request: {}", .0.message())]
    Rejected(StoreEnvelope),
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    /// The error envelope to hand back to a client: the store's own when it
    /// sent one, otherwise one describing the failure.
    pub fn into_envelope(self) -> StoreEnvelope {
        match self {
            Self::Rejected(envelope) => envelope,
            Self::Status {
                envelope: Some(envelope),
                ..
            } => envelope,
            other => StoreEnvelope::error(other.to_string()),
        }
    }
}

/// Free-form record fields forwarded to the store untouched.
pub type Fields = Map<String, JsonValue>;

/// Request body understood by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StoreRequest {
    CreateOrder(Fields),
    UpdateOrder(Fields),
    GetAllOrders,
    CreateDrone(Fields),
    UpdateDrone(Fields),
    GetAllDrones,
    ResetOrdersToStorage { courier: String },
    MarkDroneCrashed { courier: String },
}

impl StoreRequest {
    pub fn create_order(fields: Fields) -> Self {
        Self::CreateOrder(strip_type(fields))
    }

    pub fn update_order(fields: Fields) -> Self {
        Self::UpdateOrder(strip_type(fields))
    }

    pub fn create_drone(fields: Fields) -> Self {
        Self::CreateDrone(strip_type(fields))
    }

    pub fn update_drone(fields: Fields) -> Self {
        Self::UpdateDrone(strip_type(fields))
    }

    pub fn reset_orders_to_storage(courier: impl Into<String>) -> Self {
        Self::ResetOrdersToStorage {
            courier: courier.into(),
        }
    }

    pub fn mark_drone_crashed(courier: impl Into<String>) -> Self {
        Self::MarkDroneCrashed {
            courier: courier.into(),
        }
    }

    /// The `type` discriminator sent on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateOrder(_) => "CreateOrder",
            Self::UpdateOrder(_) => "UpdateOrder",
            Self::GetAllOrders => "GetAllOrders",
            Self::CreateDrone(_) => "CreateDrone",
            Self::UpdateDrone(_) => "UpdateDrone",
            Self::GetAllDrones => "GetAllDrones",
            Self::ResetOrdersToStorage { .. } => "ResetOrdersToStorage",
            Self::MarkDroneCrashed { .. } => "MarkDroneCrashed",
        }
    }
}

// A client-supplied "type" would collide with the discriminator.
fn strip_type(mut fields: Fields) -> Fields {
    fields.remove("type");
    fields
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// Response envelope returned by the store for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEnvelope {
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: JsonValue,
}

impl StoreEnvelope {
    pub fn success(data: JsonValue) -> Self {
        Self {
            status: EnvelopeStatus::Success,
            timestamp: chrono::Utc::now().timestamp(),
            data,
        }
    }

    /// Error envelope in the same shape the store uses for its own failures
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            timestamp: chrono::Utc::now().timestamp(),
            data: JsonValue::String(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EnvelopeStatus::Success
    }

    /// Human-readable form of `data`
    pub fn message(&self) -> String {
        match &self.data {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => "no details".to_string(),
            other => other.to_string(),
        }
    }
}

/// Request/response access to the order/drone store.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Send one request. Any non-success outcome is an `Err`.
    async fn send(&self, request: StoreRequest) -> Result<StoreEnvelope, StoreError>;
}

pub struct StoreClient {
    client: Client,
    endpoint: String,
}

impl StoreClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            warn!("Store client setup failed ({}); requests will have no timeout", e);
            Client::new()
        });

        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OrderStore for StoreClient {
    async fn send(&self, request: StoreRequest) -> Result<StoreEnvelope, StoreError> {
        let kind = request.kind();
        debug!("Sending {} request to: {}", kind, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("{} request failed: {}", kind, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Request(format!("{} body read failed: {}", kind, e)))?;
        let parsed = serde_json::from_str::<StoreEnvelope>(&body);

        if !status.is_success() {
            let envelope = parsed.ok().filter(|envelope| !envelope.is_success());
            let message = match &envelope {
                Some(envelope) => envelope.message(),
                None => body,
            };
            return Err(StoreError::Status {
                status: status.as_u16(),
                message,
                envelope,
            });
        }

        let envelope = parsed.map_err(|e| StoreError::Malformed(format!("{}: {}", kind, e)))?;
        if !envelope.is_success() {
            return Err(StoreError::Rejected(envelope));
        }

        Ok(envelope)
    }
}
