//! Core transport traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BrokerError;

/// A message read off a destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Destination the message was consumed from.
    pub destination: String,
    /// Raw body.
    pub body: Vec<u8>,
    /// Content type declared by the producer, if any.
    pub content_type: Option<String>,
}

impl Delivery {
    pub fn new(destination: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            destination: destination.into(),
            body,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Auto-acknowledged stream of deliveries. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A consumer attached to a destination.
///
/// Dropping the stream stops reading but does not detach the consumer on every broker;
/// call [`Channel::cancel`] with the tag to stop the broker routing messages to it.
pub struct Subscription {
    /// Consumer tag, unique per channel.
    pub tag: String,
    pub stream: DeliveryStream,
}

/// Dials a broker.
///
/// Implementations might include:
/// - `InMemoryBroker` - for tests and single-process use
/// - `AmqpConnector` - RabbitMQ via lapin
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to the broker at `address`.
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the connection and every channel on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// The session object used to publish and consume.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Create the destination if it does not exist. Idempotent.
    async fn declare(&self, destination: &str) -> Result<(), BrokerError>;

    /// Start an auto-acknowledged consumer on the destination.
    async fn consume(&self, destination: &str) -> Result<Subscription, BrokerError>;

    /// Detach the consumer with this tag. Unknown tags are ignored.
    async fn cancel(&self, tag: &str) -> Result<(), BrokerError>;

    /// Send a body to the destination.
    async fn publish(
        &self,
        destination: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BrokerError>;

    /// Resolves once the channel has closed, for any reason.
    async fn closed(&self);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}
