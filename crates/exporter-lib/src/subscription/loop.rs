//! Subscription state machine
//!
//! `Idle → Connecting → Streaming → Backoff → Connecting → … → Stopped`
//!
//! Every connection or stream failure leads to `Backoff`, which waits a
//! fixed delay before reconnecting. Retries are unbounded; only
//! cancellation ends the loop. Events emitted by the runtime while the loop
//! is not `Streaming` are not recovered.

use super::SubscriptionError;
use crate::events::{normalize, ConnectionSession, EventSource, EventSourceError, RawEvent};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::sleep_or_cancelled;
use crate::observability::StructuredLogger;
use crate::store::CounterStore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fixed delay between a failure and the next connection attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Transport error reported when a session ends without an error of its own
const SESSION_CLOSED: &str = "event source closed";

/// Event stream health message until the first session opens
pub const STREAM_CONNECTING: &str = "connecting";

/// States of the subscription loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not started
    Idle,
    /// Establishing a session with the event source
    Connecting,
    /// Consuming events from a live session
    Streaming,
    /// Waiting before the next connection attempt
    Backoff,
    /// Terminal
    Stopped,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Idle => "idle",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Streaming => "streaming",
            SubscriptionState::Backoff => "backoff",
            SubscriptionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the subscription loop
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Constant back-off between attempts (default: 5 seconds)
    pub reconnect_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Counters describing loop activity
#[derive(Debug, Default)]
pub struct LoopStats {
    sessions_opened: AtomicU64,
    connection_failures: AtomicU64,
    stream_failures: AtomicU64,
    events_processed: AtomicU64,
}

impl LoopStats {
    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            stream_failures: self.stream_failures.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LoopStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStatsSnapshot {
    pub sessions_opened: u64,
    pub connection_failures: u64,
    pub stream_failures: u64,
    pub events_processed: u64,
}

/// Result of one connection attempt
enum Attempt {
    Connected(ConnectionSession),
    Failed(EventSourceError),
    Cancelled,
}

/// How a streaming session ended
enum SessionEnd {
    Cancelled,
    Failed(EventSourceError),
}

/// Long-lived subscription that survives runtime restarts
pub struct SubscriptionLoop {
    source: Arc<dyn EventSource>,
    store: CounterStore,
    config: SubscriptionConfig,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    state_tx: watch::Sender<SubscriptionState>,
    stats: Arc<LoopStats>,
}

impl SubscriptionLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: CounterStore,
        config: SubscriptionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SubscriptionState::Idle);

        Self {
            source,
            store,
            config,
            health: None,
            logger: StructuredLogger::new("docker"),
            state_tx,
            stats: Arc::new(LoopStats::default()),
        }
    }

    /// Report event stream health to `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Receiver observing every state transition
    pub fn state(&self) -> watch::Receiver<SubscriptionState> {
        self.state_tx.subscribe()
    }

    /// Shared activity counters
    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> LoopStatsSnapshot {
        info!(
            reconnect_delay_secs = self.config.reconnect_delay.as_secs_f64(),
            "Starting event subscription loop"
        );

        let mut state = SubscriptionState::Idle;
        let mut session: Option<ConnectionSession> = None;
        self.mark_stream_degraded(STREAM_CONNECTING).await;

        loop {
            let next = match state {
                SubscriptionState::Idle => SubscriptionState::Connecting,

                SubscriptionState::Connecting => match self.connect(&shutdown).await {
                    Attempt::Connected(opened) => {
                        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
                        self.set_stream_healthy().await;
                        session = Some(opened);
                        SubscriptionState::Streaming
                    }
                    Attempt::Failed(e) => {
                        self.stats.connection_failures.fetch_add(1, Ordering::Relaxed);
                        self.logger
                            .log_connection_failed(&e.to_string(), self.config.reconnect_delay);
                        self.set_stream_degraded(&e).await;
                        SubscriptionState::Backoff
                    }
                    Attempt::Cancelled => SubscriptionState::Stopped,
                },

                SubscriptionState::Streaming => match session.take() {
                    Some(mut active) => {
                        let (end, processed) = self.stream(&mut active, &shutdown).await;
                        // Release the transport before waiting
                        drop(active);

                        match end {
                            SessionEnd::Cancelled => SubscriptionState::Stopped,
                            SessionEnd::Failed(e) => {
                                self.stats.stream_failures.fetch_add(1, Ordering::Relaxed);
                                self.logger.log_stream_failed(
                                    &e.to_string(),
                                    processed,
                                    self.config.reconnect_delay,
                                );
                                self.set_stream_degraded(&e).await;
                                SubscriptionState::Backoff
                            }
                        }
                    }
                    None => SubscriptionState::Connecting,
                },

                SubscriptionState::Backoff => {
                    if sleep_or_cancelled(&shutdown, self.config.reconnect_delay).await {
                        SubscriptionState::Connecting
                    } else {
                        SubscriptionState::Stopped
                    }
                }

                SubscriptionState::Stopped => break,
            };

            self.transition(&mut state, next);
        }

        let stats = self.stats.snapshot();
        self.logger
            .log_loop_stopped(stats.sessions_opened, stats.events_processed);
        stats
    }

    async fn connect(&self, shutdown: &CancellationToken) -> Attempt {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Attempt::Cancelled,
            result = self.source.connect() => match result {
                Ok(session) => Attempt::Connected(session),
                Err(e) => Attempt::Failed(e),
            },
        }
    }

    /// Consume one session until it fails or shutdown is requested.
    ///
    /// Buffered events are drained before a pending error is taken, so
    /// nothing the session delivered ahead of its error is dropped. A
    /// session whose producer went away without reporting an error ends
    /// as a transport failure.
    async fn stream(
        &self,
        session: &mut ConnectionSession,
        shutdown: &CancellationToken,
    ) -> (SessionEnd, u64) {
        let (events, errors) = session.receivers();
        let mut processed = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return (SessionEnd::Cancelled, processed),
                event = events.recv() => match event {
                    Some(event) => {
                        self.process(&event);
                        processed += 1;
                    }
                    None => {
                        let error = errors.try_recv().unwrap_or_else(|_| {
                            EventSourceError::Transport(SESSION_CLOSED.to_string())
                        });
                        return (SessionEnd::Failed(error), processed);
                    }
                },
                Some(error) = errors.recv() => return (SessionEnd::Failed(error), processed),
            }
        }
    }

    fn process(&self, event: &RawEvent) {
        let key = normalize(event);
        self.logger.log_exit_event(&event.actor_id, &key);
        self.store.increment(&key);
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn transition(&self, state: &mut SubscriptionState, next: SubscriptionState) {
        debug!(from = %state, to = %next, "Subscription state change");
        *state = next;
        self.state_tx.send_replace(next);
    }

    async fn set_stream_healthy(&self) {
        if let Some(health) = &self.health {
            health.set_healthy(components::EVENT_STREAM).await;
        }
    }

    async fn set_stream_degraded(&self, error: &EventSourceError) {
        self.mark_stream_degraded(&error.to_string()).await;
    }

    async fn mark_stream_degraded(&self, message: &str) {
        if let Some(health) = &self.health {
            health.set_degraded(components::EVENT_STREAM, message).await;
        }
    }
}

/// Builder for [`SubscriptionLoop`]
#[derive(Default)]
pub struct SubscriptionLoopBuilder {
    source: Option<Arc<dyn EventSource>>,
    store: Option<CounterStore>,
    config: SubscriptionConfig,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl SubscriptionLoopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn store(mut self, store: CounterStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the back-off delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<SubscriptionLoop, SubscriptionError> {
        let source = self.source.ok_or(SubscriptionError::MissingSource)?;
        let store = self.store.ok_or(SubscriptionError::MissingStore)?;

        let mut subscription = SubscriptionLoop::new(source, store, self.config);
        if let Some(health) = self.health {
            subscription = subscription.with_health(health);
        }
        if let Some(logger) = self.logger {
            subscription = subscription.with_logger(logger);
        }

        Ok(subscription)
    }
}
