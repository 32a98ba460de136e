//! Consumer registry — the bindings started at connect and replayed after every reconnect.
//!
//! ## Example
//!
//! ```
//! use resilient_broker::{ConsumerBinding, ConsumerRegistry};
//!
//! let registry = ConsumerRegistry::new();
//! registry
//!     .register(ConsumerBinding::new("orders.created", |event| async move {
//!         println!("{} by {}", event.resource, event.created_by);
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! assert_eq!(registry.routing_keys(), vec!["orders.created"]);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;

use super::stats::{DispatchStats, StatsCounters};
use crate::envelope::EventEnvelope;
use crate::error::{CallbackError, ValidationError};

/// A boxed consumer callback.
pub type Callback =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, Result<(), CallbackError>> + Send + Sync>;

/// A routing key paired with the callback that processes its messages.
///
/// Cloning is cheap; clones share the callback, the statistics and the callback slots.
#[derive(Clone)]
pub struct ConsumerBinding {
    routing_key: String,
    callback: Callback,
    stats: Arc<StatsCounters>,
    /// Callback slots shared by every stream this binding runs on, so a stream left
    /// over from a dropped session cannot push the binding past its limit.
    slots: Arc<OnceLock<Semaphore>>,
}

impl ConsumerBinding {
    /// Bind an async callback to a routing key.
    pub fn new<F, Fut>(routing_key: impl Into<String>, callback: F) -> Self
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        Self {
            routing_key: routing_key.into(),
            callback: Arc::new(move |event| callback(event).boxed()),
            stats: Arc::new(StatsCounters::default()),
            slots: Arc::new(OnceLock::new()),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Counters accumulated by every stream this binding has run on.
    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.stats
    }

    /// Callback slots, sized to `limit` by the first stream that asks.
    pub(crate) fn slots(&self, limit: usize) -> &Semaphore {
        self.slots.get_or_init(|| Semaphore::new(limit.max(1)))
    }

    pub(crate) fn invoke(&self, event: EventEnvelope) -> BoxFuture<'static, Result<(), CallbackError>> {
        (self.callback)(event)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.routing_key.is_empty() {
            return Err(ValidationError::EmptyRoutingKey);
        }
        Ok(())
    }
}

impl fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// Ordered, append-only set of consumer bindings.
///
/// Duplicate routing keys are accepted: each registration gets its own stream, so the
/// broker splits that destination's messages between them.
#[derive(Default)]
pub struct ConsumerRegistry {
    bindings: Mutex<Vec<ConsumerBinding>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ConsumerBinding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a binding.
    pub fn register(&self, binding: ConsumerBinding) -> Result<(), ValidationError> {
        binding.validate()?;
        let mut bindings = self.lock();
        if bindings
            .iter()
            .any(|b| b.routing_key == binding.routing_key)
        {
            tracing::warn!(
                routing_key = %binding.routing_key,
                "duplicate consumer registration; messages will be split between streams"
            );
        }
        bindings.push(binding);
        Ok(())
    }

    /// Swap the whole set, returning the previous bindings.
    ///
    /// Nothing changes if any new binding is invalid.
    pub fn replace_all(
        &self,
        bindings: Vec<ConsumerBinding>,
    ) -> Result<Vec<ConsumerBinding>, ValidationError> {
        for binding in &bindings {
            binding.validate()?;
        }
        Ok(std::mem::replace(&mut *self.lock(), bindings))
    }

    /// Current bindings, in registration order.
    pub fn snapshot(&self) -> Vec<ConsumerBinding> {
        self.lock().clone()
    }

    /// First binding registered for a routing key.
    pub fn find(&self, routing_key: &str) -> Option<ConsumerBinding> {
        self.lock()
            .iter()
            .find(|b| b.routing_key == routing_key)
            .cloned()
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.lock().iter().map(|b| b.routing_key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
