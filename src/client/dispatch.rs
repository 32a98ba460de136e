//! Per-binding consumer streams with a bounded worker pool.
//!
//! For each binding on each session:
//!
//! ```text
//! declare ─► consume ─► reader ──(bounded queue)──► worker × concurrency ─► callback
//!    ▲           │
//!    └─ backoff ─┘ on failure
//! ```
//!
//! Messages are auto-acknowledged by the broker as soon as they are read, so a decode
//! failure, a validation failure or a failed callback only gets logged.
//! At most `concurrency` callbacks run at once; when every worker is busy and the queue
//! is full the reader stops pulling from the stream.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::ConsumerBinding;
use super::stats::StatsCounters;
use crate::bus::{Channel, Delivery, Subscription};
use crate::config::ClientConfig;
use crate::envelope::EventEnvelope;
use crate::error::BrokerError;
use crate::policies::BackoffPolicy;

/// Worker pool and retry knobs for a dispatch engine.
#[derive(Clone, Copy, Debug)]
pub struct DispatchSettings {
    /// Number of workers, i.e. maximum concurrent callbacks.
    pub concurrency: usize,
    /// Capacity of the queue between the stream reader and the workers.
    pub queue_capacity: usize,
    /// Delay schedule for retrying a failed declare or stream open.
    pub retry: BackoffPolicy,
}

impl From<&ClientConfig> for DispatchSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            queue_capacity: config.queue_capacity_resolved(),
            retry: config.reconnect,
        }
    }
}

type WorkQueue = Arc<Mutex<mpsc::Receiver<EventEnvelope>>>;

/// Runs one consumer binding against one channel until cancelled or the channel closes.
pub struct DispatchEngine {
    channel: Arc<dyn Channel>,
    binding: ConsumerBinding,
    generation: u64,
    settings: DispatchSettings,
    token: CancellationToken,
}

impl DispatchEngine {
    pub fn new(
        channel: Arc<dyn Channel>,
        binding: ConsumerBinding,
        generation: u64,
        settings: DispatchSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            binding,
            generation,
            settings,
            token,
        }
    }

    /// Declare, consume and dispatch until cancelled or the channel closes.
    ///
    /// A stream that ends while the channel is still open is reopened.
    pub async fn run(self) {
        while let Some(subscription) = self.open().await {
            self.drain(subscription).await;

            if self.token.is_cancelled() || !self.channel.is_open() {
                break;
            }
            warn!(
                routing_key = %self.binding.routing_key(),
                generation = self.generation,
                "consumer stream ended; reopening"
            );
        }
        debug!(
            routing_key = %self.binding.routing_key(),
            generation = self.generation,
            "dispatch stopped"
        );
    }

    async fn open(&self) -> Option<Subscription> {
        let mut attempt: u32 = 0;
        loop {
            if self.token.is_cancelled() || !self.channel.is_open() {
                return None;
            }

            match self.declare_and_consume().await {
                Ok(subscription) => {
                    StatsCounters::bump(&self.binding.counters().streams_opened);
                    info!(
                        routing_key = %self.binding.routing_key(),
                        generation = self.generation,
                        "consumer stream opened"
                    );
                    return Some(subscription);
                }
                Err(err) => {
                    error!(
                        routing_key = %self.binding.routing_key(),
                        generation = self.generation,
                        attempt,
                        error = %err,
                        "failed to open consumer stream; retrying"
                    );
                    let delay = self.settings.retry.next(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = self.token.cancelled() => return None,
                        _ = self.channel.closed() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn declare_and_consume(&self) -> Result<Subscription, BrokerError> {
        let destination = self.binding.routing_key();
        self.channel.declare(destination).await?;
        self.channel.consume(destination).await
    }

    async fn drain(&self, subscription: Subscription) {
        let Subscription { tag, mut stream } = subscription;
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let queue: WorkQueue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker in 0..self.settings.concurrency.max(1) {
            workers.spawn(work(
                worker,
                Arc::clone(&queue),
                self.binding.clone(),
                self.settings.concurrency,
                self.token.clone(),
            ));
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.next() => next,
            };
            let delivery = match next {
                None => break,
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    warn!(
                        routing_key = %self.binding.routing_key(),
                        generation = self.generation,
                        error = %err,
                        "consumer stream failed"
                    );
                    break;
                }
            };

            StatsCounters::bump(&self.binding.counters().received);
            let Some(event) = self.decode(&delivery) else {
                continue;
            };

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        // Detach from the broker before waiting on callbacks, or it keeps routing
        // messages to a consumer nobody reads.
        drop(stream);
        if self.channel.is_open() {
            if let Err(err) = self.channel.cancel(&tag).await {
                debug!(
                    routing_key = %self.binding.routing_key(),
                    tag = %tag,
                    error = %err,
                    "consumer cancel failed"
                );
            }
        }

        // Closing the queue lets workers finish what was already read, then exit.
        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(
                    routing_key = %self.binding.routing_key(),
                    error = %err,
                    "dispatch worker aborted"
                );
            }
        }
    }

    fn decode(&self, delivery: &Delivery) -> Option<EventEnvelope> {
        let event = match EventEnvelope::decode(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                StatsCounters::bump(&self.binding.counters().decode_failed);
                error!(
                    routing_key = %self.binding.routing_key(),
                    generation = self.generation,
                    error = %err,
                    "consumer failed to decode message; dropping"
                );
                return None;
            }
        };

        if let Err(err) = event.validate() {
            StatsCounters::bump(&self.binding.counters().invalid);
            warn!(
                routing_key = %self.binding.routing_key(),
                generation = self.generation,
                error = %err,
                "consumer received invalid event; dropping"
            );
            return None;
        }

        Some(event)
    }
}

async fn work(
    worker: usize,
    queue: WorkQueue,
    binding: ConsumerBinding,
    limit: usize,
    token: CancellationToken,
) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                event = queue.recv() => event,
            }
        };
        let Some(event) = next else {
            break;
        };

        // Slots outlive sessions: a callback still running on a dropped session counts.
        let slot = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            slot = binding.slots(limit).acquire() => slot,
        };
        let Ok(_slot) = slot else {
            break;
        };

        match AssertUnwindSafe(async { binding.invoke(event).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => StatsCounters::bump(&binding.counters().handled),
            Ok(Err(err)) => {
                StatsCounters::bump(&binding.counters().failed);
                let err = BrokerError::Callback(err);
                error!(
                    routing_key = %binding.routing_key(),
                    worker,
                    error = %err,
                    "consumer callback failed"
                );
            }
            Err(_) => {
                StatsCounters::bump(&binding.counters().failed);
                error!(
                    routing_key = %binding.routing_key(),
                    worker,
                    "consumer callback panicked"
                );
            }
        }
    }
}
