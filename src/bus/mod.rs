//! Broker transport seam.
//!
//! The client talks to a broker only through the traits in this module, so the
//! supervisor, dispatch engine and publisher are the same code whether the far end is
//! RabbitMQ or the in-process broker used by tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 BrokerClient (per service)                  │
//! │  Supervisor · ConsumerRegistry · DispatchEngine · Publisher │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Connector → Connection → Channel                 │
//! │  Channel: declare / consume / cancel / publish / close      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌──────────────────┐              ┌──────────────────────────┐
//! │  InMemoryBroker  │              │  AmqpConnector (lapin)   │
//! │   (included)     │              │   feature = "amqp"       │
//! └──────────────────┘              └──────────────────────────┘
//! ```

#[cfg(feature = "amqp")]
mod amqp;
mod in_memory;
mod transport;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use in_memory::InMemoryBroker;
pub use transport::{Channel, Connection, Connector, Delivery, DeliveryStream, Subscription};
