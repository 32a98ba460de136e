//! The event envelope exchanged over the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, ValidationError};

/// Content type declared on every published body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An event exchanged between services.
///
/// `data` is opaque to the client; its shape belongs to the producer.
/// Missing fields decode to empty values and are then rejected by [`validate`](Self::validate).
///
/// ## Example
///
/// ```
/// use resilient_broker::EventEnvelope;
/// use serde_json::json;
///
/// let event = EventEnvelope::new("order", "orders.created", "svc-a")
///     .with_data(json!({ "id": "o-1" }));
///
/// assert!(event.validate().is_ok());
/// let decoded = EventEnvelope::decode(&event.encode().unwrap()).unwrap();
/// assert_eq!(decoded, event);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Event type (e.g. "order").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Resource the event is about (e.g. "orders.created").
    pub resource: String,
    /// Producer-defined payload.
    pub data: Value,
    /// Actor that produced the event.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create an envelope stamped with the current time and no data.
    pub fn new(
        event_type: impl Into<String>,
        resource: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_type: event_type.into(),
            resource: resource.into(),
            data: Value::Null,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check the required fields, in the order `createdBy`, `type`, `resource`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.created_by.is_empty() {
            return Err(ValidationError::MissingField("createdBy"));
        }
        if self.event_type.is_empty() {
            return Err(ValidationError::MissingField("type"));
        }
        if self.resource.is_empty() {
            return Err(ValidationError::MissingField("resource"));
        }
        Ok(())
    }

    /// Encode as JSON.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a JSON body.
    pub fn decode(body: &[u8]) -> Result<Self, BrokerError> {
        Ok(serde_json::from_slice(body)?)
    }
}
