//! In-memory broker for testing and single-process scenarios.
//!
//! This module provides a thread-safe broker that implements the transport traits,
//! useful for:
//! - Unit and integration testing without a running RabbitMQ
//! - Exercising reconnect paths through fault injection
//! - Single-process applications

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Channel, Connection, Connector, Delivery, Subscription};
use crate::error::BrokerError;

/// In-memory broker.
///
/// Features:
/// - Thread-safe (can be shared across tasks via `Clone`)
/// - Destinations are competing-consumer queues: each message reaches exactly one
///   live consumer, round robin
/// - Messages published to a destination with no consumer are buffered until one attaches
/// - Fault injection: [`sever`](Self::sever), [`set_offline`](Self::set_offline),
///   [`refuse_dials`](Self::refuse_dials)
///
/// ## Example
///
/// ```
/// use resilient_broker::bus::{Channel, Connection, Connector, InMemoryBroker};
///
/// # tokio_test_block(async {
/// let broker = InMemoryBroker::new();
/// let connection = broker.connect("memory://local").await.unwrap();
/// let channel = connection.open_channel().await.unwrap();
///
/// channel.publish("orders", br#"{"id":1}"#.to_vec(), "application/json").await.unwrap();
/// assert_eq!(broker.pending("orders"), 1);
///
/// broker.sever();
/// assert!(!channel.is_open());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Queue>>,
    /// Live channels: id → (owning connection id, close token)
    channels: Mutex<HashMap<u64, (u64, CancellationToken)>>,
    /// Every accepted publish, in order
    published: Mutex<Vec<Delivery>>,
    next_id: AtomicU64,
    dials: AtomicUsize,
    refused: AtomicUsize,
    offline: AtomicBool,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Delivery>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

struct Consumer {
    channel: u64,
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Queue {
    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.cursor % self.consumers.len();
            match self.consumers[idx].tx.send(delivery) {
                Ok(()) => {
                    self.cursor = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }
        self.pending.push_back(delivery);
    }

    fn attach(&mut self, consumer: Consumer) {
        self.consumers.push(consumer);
        let backlog: Vec<Delivery> = self.pending.drain(..).collect();
        for delivery in backlog {
            self.deliver(delivery);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every live channel, as if the connection dropped.
    ///
    /// Consumer streams end and `Channel::closed` resolves. Buffered messages stay queued.
    pub fn sever(&self) {
        let ids: Vec<u64> = lock(&self.state.channels).keys().copied().collect();
        for id in ids {
            self.close_channel(id);
        }
    }

    /// While offline, every dial and channel open fails.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` dials.
    pub fn refuse_dials(&self, n: usize) {
        self.state.refused.store(n, Ordering::SeqCst);
    }

    /// Total dial attempts, successful or not.
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        lock(&self.state.channels).len()
    }

    /// Number of live consumers attached to a destination.
    pub fn consumer_count(&self, destination: &str) -> usize {
        lock(&self.state.queues)
            .get(destination)
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Messages buffered on a destination waiting for a consumer.
    pub fn pending(&self, destination: &str) -> usize {
        lock(&self.state.queues)
            .get(destination)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    /// Whether the destination has been declared or published to.
    pub fn has_destination(&self, destination: &str) -> bool {
        lock(&self.state.queues).contains_key(destination)
    }

    /// Every message accepted for a destination, in publish order.
    pub fn published(&self, destination: &str) -> Vec<Delivery> {
        lock(&self.state.published)
            .iter()
            .filter(|d| d.destination == destination)
            .cloned()
            .collect()
    }

    /// Enqueue an arbitrary body without going through a channel.
    pub fn publish_raw(&self, destination: &str, body: impl Into<Vec<u8>>) {
        self.enqueue(Delivery::new(destination, body.into()));
    }

    fn enqueue(&self, delivery: Delivery) {
        lock(&self.state.published).push(delivery.clone());
        lock(&self.state.queues)
            .entry(delivery.destination.clone())
            .or_default()
            .deliver(delivery);
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn close_channel(&self, id: u64) {
        if let Some((_, token)) = lock(&self.state.channels).remove(&id) {
            token.cancel();
        }
        for queue in lock(&self.state.queues).values_mut() {
            queue.consumers.retain(|c| c.channel != id);
        }
    }

    fn close_connection(&self, connection: u64) {
        let ids: Vec<u64> = lock(&self.state.channels)
            .iter()
            .filter(|(_, (owner, _))| *owner == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.close_channel(id);
        }
    }

    fn unreachable(&self, address: &str) -> Option<BrokerError> {
        if self.state.offline.load(Ordering::SeqCst) {
            return Some(BrokerError::transport("dial", format!("{address} unreachable")));
        }
        let refused = self
            .state
            .refused
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Some(BrokerError::transport("dial", "connection refused"));
        }
        None
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.unreachable(address) {
            return Err(err);
        }
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            id: self.next_id(),
            token: CancellationToken::new(),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    token: CancellationToken,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if self.token.is_cancelled() {
            return Err(BrokerError::transport("open channel", "connection closed"));
        }
        if self.broker.state.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::transport("open channel", "broker unreachable"));
        }
        let id = self.broker.next_id();
        let token = self.token.child_token();
        lock(&self.broker.state.channels).insert(id, (self.id, token.clone()));
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
            token,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.token.cancel();
        self.broker.close_connection(self.id);
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    token: CancellationToken,
}

impl InMemoryChannel {
    fn ensure_open(&self, operation: &str) -> Result<(), BrokerError> {
        if self.token.is_cancelled() {
            Err(BrokerError::transport(operation, "channel closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare(&self, destination: &str) -> Result<(), BrokerError> {
        self.ensure_open("declare")?;
        lock(&self.broker.state.queues)
            .entry(destination.to_string())
            .or_default();
        Ok(())
    }

    async fn consume(&self, destination: &str) -> Result<Subscription, BrokerError> {
        self.ensure_open("consume")?;
        let tag = format!("ctag-{}.{}", self.id, self.broker.next_id());
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.broker.state.queues)
            .entry(destination.to_string())
            .or_default()
            .attach(Consumer {
                channel: self.id,
                tag: tag.clone(),
                tx,
            });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Subscription {
            tag,
            stream: stream
                .take_until(self.token.clone().cancelled_owned())
                .map(Ok)
                .boxed(),
        })
    }

    async fn cancel(&self, tag: &str) -> Result<(), BrokerError> {
        for queue in lock(&self.broker.state.queues).values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == tag));
        }
        Ok(())
    }

    async fn publish(
        &self,
        destination: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open("publish")?;
        self.broker
            .enqueue(Delivery::new(destination, body).with_content_type(content_type));
        Ok(())
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}
