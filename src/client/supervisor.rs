//! Connection supervisor — owns the live session, watches it, and rebuilds it.
//!
//! A session is one connection plus one channel, tagged with a generation number.
//! The current session sits behind a read-write lock holding an `Arc`; readers clone
//! the `Arc` and keep using that snapshot even if a reconnect swaps in a new one.
//!
//! ```text
//! connect ─► install(gen 1) ─► watch ──closed()──► reconnect ──ok──► install(gen n+1) ─┐
//!                                ▲                    │  ▲                              │
//!                                │                    └──┘ backoff                      │
//!                                └──────────────────────────────────────────────────────┘
//! ```
//!
//! Installing a session cancels every dispatch engine of the previous one before the
//! registry is replayed, so a binding never streams from a stale and a fresh channel
//! at the same time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::dispatch::{DispatchEngine, DispatchSettings};
use super::registry::{ConsumerBinding, ConsumerRegistry};
use crate::bus::{Channel, Connection, Connector};
use crate::config::ClientConfig;
use crate::error::BrokerError;

/// Connection lifecycle as seen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// A session is installed and its consumers are running.
    Connected {
        /// Session number, starting at 1 and bumped on every reconnect.
        generation: u64,
    },
    /// The channel closed; `attempt` redials have failed so far.
    ///
    /// Reported as soon as the channel is seen closed, before the first redial.
    Reconnecting { attempt: u32 },
    /// The client has shut down.
    Closed,
}

/// One live connection + channel.
pub(crate) struct Session {
    pub(crate) generation: u64,
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) channel: Arc<dyn Channel>,
    token: CancellationToken,
    /// Scope of the current binding set; replaced by `replace_all`.
    scope: Mutex<CancellationToken>,
}

impl Session {
    fn scope(&self) -> CancellationToken {
        lock(&self.scope).clone()
    }

    fn rescope(&self) -> CancellationToken {
        let mut scope = lock(&self.scope);
        scope.cancel();
        *scope = self.token.child_token();
        scope.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Supervisor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<Session>>>,
    registry: ConsumerRegistry,
    /// Serializes install-and-replay against register-and-start.
    replay: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Supervisor {
    /// Dial, install the first session and start the watch loop.
    ///
    /// A failure here is returned to the caller rather than retried.
    pub(crate) async fn start(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, BrokerError> {
        config.validate()?;
        let (connection, channel) = dial(connector.as_ref(), &config.address).await?;
        info!(address = %config.redacted_address(), "connected to broker");

        // Overwritten by the first install, before anyone can subscribe.
        let (state, _) = watch::channel(ConnectionState::Closed);
        let supervisor = Arc::new(Self {
            config,
            connector,
            current: RwLock::new(None),
            registry: ConsumerRegistry::new(),
            replay: Mutex::new(()),
            state,
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        let session = supervisor
            .install(connection, channel)
            .ok_or(BrokerError::Shutdown)?;
        let watcher = Arc::clone(&supervisor);
        supervisor.tasks.spawn(watcher.watch(session));
        Ok(supervisor)
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// Published state, corrected for a channel that closed before the watch loop
    /// got to announce it.
    pub(crate) fn state(&self) -> ConnectionState {
        let state = *self.state.borrow();
        match state {
            ConnectionState::Connected { generation } if !self.is_live(generation) => {
                ConnectionState::Reconnecting { attempt: 0 }
            }
            state => state,
        }
    }

    /// Whether `generation` is the installed session and its channel is still open.
    fn is_live(&self, generation: u64) -> bool {
        self.current()
            .is_some_and(|s| s.generation == generation && s.channel.is_open())
    }

    /// Wait until a session with an open channel is installed.
    pub(crate) async fn wait_connected(&self) -> Result<u64, BrokerError> {
        let mut state = self.state.subscribe();
        loop {
            let seen = *state.borrow_and_update();
            match seen {
                ConnectionState::Closed => return Err(BrokerError::Shutdown),
                ConnectionState::Connected { generation } if self.is_live(generation) => {
                    return Ok(generation)
                }
                _ => {}
            }
            // A closed channel always leads to a Reconnecting or Closed update.
            state.changed().await.map_err(|_| BrokerError::Shutdown)?;
        }
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn current(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Session to publish on, or why there is none.
    pub(crate) fn snapshot(&self) -> Result<Arc<Session>, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        self.current()
            .ok_or_else(|| BrokerError::transport("publish", "not connected"))
    }

    pub(crate) fn register(&self, binding: ConsumerBinding) -> Result<(), BrokerError> {
        let _replay = lock(&self.replay);
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        self.registry.register(binding.clone())?;

        // A closed channel is left to the next replay.
        if let Some(session) = self.current().filter(|s| s.channel.is_open()) {
            let scope = session.scope();
            self.start_dispatch(&session, &scope, binding);
        }
        Ok(())
    }

    pub(crate) fn replace_all(&self, bindings: Vec<ConsumerBinding>) -> Result<(), BrokerError> {
        let _replay = lock(&self.replay);
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Shutdown);
        }
        let previous = self.registry.replace_all(bindings.clone())?;
        info!(
            previous = previous.len(),
            bindings = bindings.len(),
            "consumer bindings replaced"
        );

        if let Some(session) = self.current() {
            let scope = session.rescope();
            if session.channel.is_open() {
                for binding in bindings {
                    self.start_dispatch(&session, &scope, binding);
                }
            }
        }
        Ok(())
    }

    fn start_dispatch(
        &self,
        session: &Arc<Session>,
        scope: &CancellationToken,
        binding: ConsumerBinding,
    ) {
        let engine = DispatchEngine::new(
            Arc::clone(&session.channel),
            binding,
            session.generation,
            DispatchSettings::from(&self.config),
            scope.clone(),
        );
        self.tasks.spawn(engine.run());
    }

    /// Swap in a new session and replay every binding on it.
    ///
    /// Returns `None` if the client shut down while dialing.
    fn install(
        &self,
        connection: Arc<dyn Connection>,
        channel: Arc<dyn Channel>,
    ) -> Option<Arc<Session>> {
        let _replay = lock(&self.replay);
        if self.shutdown.is_cancelled() {
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();
        let session = Arc::new(Session {
            generation,
            connection,
            channel,
            scope: Mutex::new(token.child_token()),
            token,
        });

        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&session));
        if let Some(previous) = previous {
            previous.token.cancel();
            self.retire(previous);
        }

        let scope = session.scope();
        let bindings = self.registry.snapshot();
        let replayed = bindings.len();
        for binding in bindings {
            self.start_dispatch(&session, &scope, binding);
        }

        self.state
            .send_replace(ConnectionState::Connected { generation });
        info!(generation, bindings = replayed, "session installed");
        Some(session)
    }

    fn retire(&self, session: Arc<Session>) {
        self.tasks.spawn(async move {
            if let Err(err) = session.connection.close().await {
                debug!(
                    generation = session.generation,
                    error = %err,
                    "closing stale connection failed"
                );
            }
        });
    }

    async fn watch(self: Arc<Self>, mut session: Arc<Session>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = session.channel.closed() => {}
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            warn!(
                generation = session.generation,
                "broker channel closed; reconnecting"
            );
            match self.reconnect().await {
                Some(next) => session = next,
                None => break,
            }
        }
        debug!("supervisor watch loop stopped");
    }

    async fn reconnect(&self) -> Option<Arc<Session>> {
        let mut attempt: u32 = 0;
        loop {
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
            let delay = self.config.reconnect.next(attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match dial(self.connector.as_ref(), &self.config.address).await {
                Ok((connection, channel)) => {
                    info!(attempt, "re-connected to broker");
                    let installed = self.install(Arc::clone(&connection), channel);
                    if installed.is_none() {
                        let _ = connection.close().await;
                    }
                    return installed;
                }
                Err(err) => {
                    error!(attempt, error = %err, "failed to re-connect to broker");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Stop every task, close the session, and wait up to the grace period.
    pub(crate) async fn shutdown(&self) -> Result<(), BrokerError> {
        let session = self.abandon();
        if let Some(session) = session {
            if let Err(err) = session.channel.close().await {
                debug!(error = %err, "closing channel failed");
            }
            if let Err(err) = session.connection.close().await {
                debug!(error = %err, "closing connection failed");
            }
        }

        self.tasks.close();
        let grace = self.config.grace;
        if grace.is_zero() {
            return Ok(());
        }
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => {
                info!("broker client shut down");
                Ok(())
            }
            Err(_) => Err(BrokerError::GraceExceeded {
                grace,
                pending: self.tasks.len(),
            }),
        }
    }

    /// Cancel everything and detach the current session without waiting.
    pub(crate) fn abandon(&self) -> Option<Arc<Session>> {
        let session = {
            let _replay = lock(&self.replay);
            self.shutdown.cancel();
            self.current
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        };
        self.state.send_replace(ConnectionState::Closed);
        session
    }
}

/// Dial and open a channel; the connection is closed again if the channel fails.
async fn dial(
    connector: &dyn Connector,
    address: &str,
) -> Result<(Arc<dyn Connection>, Arc<dyn Channel>), BrokerError> {
    let connection = connector.connect(address).await?;
    match connection.open_channel().await {
        Ok(channel) => Ok((connection, channel)),
        Err(err) => {
            let _ = connection.close().await;
            Err(err)
        }
    }
}
