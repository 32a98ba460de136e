//! Broker client — connection supervision, consumer replay, bounded dispatch, publishing.
//!
//! ## Quick Start
//!
//! ```
//! use resilient_broker::bus::InMemoryBroker;
//! use resilient_broker::{BrokerClient, ClientConfig, ConsumerBinding, EventEnvelope};
//!
//! # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
//! let broker = InMemoryBroker::new();
//! let client = BrokerClient::connect(ClientConfig::new("memory://local"), broker.clone())
//!     .await
//!     .unwrap();
//!
//! client
//!     .register(ConsumerBinding::new("orders.created", |event| async move {
//!         println!("{} {}", event.event_type, event.resource);
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! let event = EventEnvelope::new("order", "orders.created", "svc-a");
//! client.publish_event("orders.created", &event).await.unwrap();
//!
//! client.shutdown().await.unwrap();
//! # });
//! ```

mod dispatch;
mod publisher;
mod registry;
mod stats;
mod supervisor;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

pub use dispatch::{DispatchEngine, DispatchSettings};
pub use publisher::Publisher;
pub use registry::{Callback, ConsumerBinding, ConsumerRegistry};
pub use stats::DispatchStats;
pub use supervisor::ConnectionState;

use supervisor::Supervisor;

#[cfg(feature = "amqp")]
use crate::bus::AmqpConnector;
use crate::bus::Connector;
use crate::config::ClientConfig;
use crate::envelope::EventEnvelope;
use crate::error::{BrokerError, CallbackError};

/// Resilient broker client.
///
/// Owns one supervised connection. Dropping the client cancels its background tasks and
/// closes the connection in the background; call [`shutdown`](Self::shutdown) to wait
/// for both.
pub struct BrokerClient {
    supervisor: Arc<Supervisor>,
}

impl BrokerClient {
    /// Dial the broker and start supervising the connection.
    ///
    /// Fails if the address is invalid or the first dial or channel open fails; there is
    /// no retry before the first successful connection.
    pub async fn connect<C: Connector>(
        config: ClientConfig,
        connector: C,
    ) -> Result<Self, BrokerError> {
        Self::connect_with(config, Arc::new(connector)).await
    }

    /// Like [`connect`](Self::connect), with a shared connector.
    pub async fn connect_with(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BrokerError> {
        let supervisor = Supervisor::start(config, connector).await?;
        Ok(Self { supervisor })
    }

    /// Connect to RabbitMQ.
    #[cfg(feature = "amqp")]
    pub async fn connect_amqp(config: ClientConfig) -> Result<Self, BrokerError> {
        Self::connect(config, AmqpConnector::new()).await
    }

    /// Register a binding and start consuming it if connected.
    pub fn register(&self, binding: ConsumerBinding) -> Result<(), BrokerError> {
        self.supervisor.register(binding)
    }

    /// Shorthand for registering a callback on a routing key.
    pub fn subscribe<F, Fut>(&self, routing_key: &str, callback: F) -> Result<(), BrokerError>
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.register(ConsumerBinding::new(routing_key, callback))
    }

    /// Swap every binding; the previous set stops consuming.
    pub fn replace_all(&self, bindings: Vec<ConsumerBinding>) -> Result<(), BrokerError> {
        self.supervisor.replace_all(bindings)
    }

    pub fn bindings(&self) -> Vec<ConsumerBinding> {
        self.supervisor.registry().snapshot()
    }

    /// Dispatch statistics of the first binding registered for `routing_key`.
    pub fn stats(&self, routing_key: &str) -> Option<DispatchStats> {
        self.supervisor
            .registry()
            .find(routing_key)
            .map(|binding| binding.stats())
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.supervisor))
    }

    /// See [`Publisher::publish`].
    pub async fn publish<T>(&self, destination: &str, payload: &T) -> Result<(), BrokerError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher().publish(destination, payload).await
    }

    /// See [`Publisher::publish_event`].
    pub async fn publish_event(
        &self,
        destination: &str,
        event: &EventEnvelope,
    ) -> Result<(), BrokerError> {
        self.publisher().publish_event(destination, event).await
    }

    pub fn config(&self) -> &ClientConfig {
        self.supervisor.config()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe_state()
    }

    /// Generation of the installed session, if any.
    pub fn generation(&self) -> Option<u64> {
        self.supervisor.current().map(|session| session.generation)
    }

    /// Wait until a session with an open channel is installed and return its generation.
    ///
    /// Right after a disconnect this waits for the reconnect rather than returning the
    /// dead session.
    ///
    /// Fails with [`BrokerError::Shutdown`] once the client is closed.
    pub async fn wait_connected(&self) -> Result<u64, BrokerError> {
        self.supervisor.wait_connected().await
    }

    /// Stop consuming, close the connection and wait for background tasks.
    pub async fn shutdown(self) -> Result<(), BrokerError> {
        self.supervisor.shutdown().await
    }
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient")
            .field("address", &self.supervisor.config().redacted_address())
            .field("state", &self.state())
            .field("bindings", &self.supervisor.registry().len())
            .finish()
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        let Some(session) = self.supervisor.abandon() else {
            return;
        };
        // Outside a runtime the transport is left to drop on its own.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = session.channel.close().await;
                let _ = session.connection.close().await;
            });
        }
    }
}
