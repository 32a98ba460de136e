//! Publisher — encodes payloads and sends them over the current channel snapshot.

use std::sync::Arc;

use serde::Serialize;

use super::supervisor::Supervisor;
use crate::envelope::{EventEnvelope, CONTENT_TYPE_JSON};
use crate::error::{BrokerError, ValidationError};

/// Fire-and-forget publishing handle.
///
/// Cheap to clone. Each call takes a snapshot of the current channel, so a reconnect
/// that happens mid-publish never hands out a half-built channel. There is no retry:
/// a publish issued while the connection is down fails with
/// [`BrokerError::Transport`]; callers that need delivery can wait with
/// [`BrokerClient::wait_connected`](crate::BrokerClient::wait_connected) and retry.
#[derive(Clone)]
pub struct Publisher {
    supervisor: Arc<Supervisor>,
}

impl Publisher {
    pub(crate) fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    /// Encode `payload` as JSON and send it to `destination`.
    pub async fn publish<T>(&self, destination: &str, payload: &T) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        if destination.is_empty() {
            return Err(ValidationError::EmptyDestination.into());
        }
        let body = serde_json::to_vec(payload)?;
        let session = self.supervisor.snapshot()?;
        session
            .channel
            .publish(destination, body, CONTENT_TYPE_JSON)
            .await
    }

    /// Validate an envelope, then publish it.
    pub async fn publish_event(
        &self,
        destination: &str,
        event: &EventEnvelope,
    ) -> Result<(), BrokerError> {
        event.validate()?;
        self.publish(destination, event).await
    }

    /// Publish payloads in order, stopping at the first failure.
    pub async fn publish_batch<T>(&self, destination: &str, payloads: &[T]) -> Result<(), BrokerError>
    where
        T: Serialize,
    {
        for payload in payloads {
            self.publish(destination, payload).await?;
        }
        Ok(())
    }
}
