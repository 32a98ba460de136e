//! Retry delay policies.
//!
//! - [`BackoffPolicy`] how reconnect and re-declare delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`] randomization to keep a fleet of clients from redialing in lockstep
//!
//! The supervisor uses one policy for redialing a dropped connection and the dispatch
//! engine reuses it for retrying a failed declare or stream open.

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
