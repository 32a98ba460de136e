//! Resilient message broker client.
//!
//! Publish JSON payloads to named destinations, consume them with a bounded number of
//! concurrent callbacks, and keep both working across connection drops: the client
//! redials on a backoff schedule and replays every registered consumer on the new
//! channel.
//!
//! Delivery is at-most-once. Consumers auto-acknowledge on receipt, and publishing is
//! fire-and-forget.

pub mod bus;
mod client;
pub mod config;
mod envelope;
mod error;
pub mod logging;
mod policies;

pub use client::{
    BrokerClient, Callback, ConnectionState, ConsumerBinding, ConsumerRegistry, DispatchEngine,
    DispatchSettings, DispatchStats, Publisher,
};
pub use config::ClientConfig;
pub use envelope::{EventEnvelope, CONTENT_TYPE_JSON};
pub use error::{BrokerError, CallbackError, ValidationError};
pub use policies::{BackoffPolicy, JitterPolicy};
