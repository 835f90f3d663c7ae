//! Behavioural tests for the subscription loop
//!
//! A scripted event source stands in for the runtime. All tests run on
//! tokio's paused clock, so back-off delays elapse instantly but are still
//! measurable.

use super::*;
use crate::events::{
    async_trait, ConnectionSession, EventSource, EventSourceError, MetricKey, RawEvent,
    SessionSender,
};
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::store::CounterStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DELAY: Duration = Duration::from_secs(5);

/// One scripted connection outcome
enum Step {
    Fail,
    Open,
}

/// Event source that replays a script of connection outcomes.
///
/// Once the script is exhausted every attempt fails.
struct ScriptedSource {
    script: Mutex<VecDeque<Step>>,
    connects: AtomicUsize,
    senders: Mutex<Vec<SessionSender>>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            connects: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        })
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Producer for the n-th opened session
    fn sender(&self, n: usize) -> SessionSender {
        self.senders.lock().unwrap()[n].clone()
    }

    /// Simulate the daemon closing every open session
    fn close_sessions(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn connect(&self) -> Result<ConnectionSession, EventSourceError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.script.lock().unwrap().pop_front();

        match step {
            Some(Step::Open) => {
                let (sender, session) = ConnectionSession::channel(16);
                self.senders.lock().unwrap().push(sender);
                Ok(session)
            }
            Some(Step::Fail) | None => Err(EventSourceError::Connection(format!(
                "connection refused (attempt {})",
                attempt
            ))),
        }
    }
}

/// Event source whose handshake never completes
struct HangingSource;

#[async_trait]
impl EventSource for HangingSource {
    async fn connect(&self) -> Result<ConnectionSession, EventSourceError> {
        std::future::pending().await
    }
}

fn exit_event(id: &str, name: &str, image: &str, code: &str) -> RawEvent {
    RawEvent::new(id)
        .with_attribute("name", name)
        .with_attribute("image", image)
        .with_attribute("exitCode", code)
}

fn build(source: Arc<dyn EventSource>, store: &CounterStore) -> SubscriptionLoop {
    SubscriptionLoopBuilder::new()
        .source(source)
        .store(store.clone())
        .reconnect_delay(DELAY)
        .build()
        .unwrap()
}

async fn wait_for_state(rx: &mut watch::Receiver<SubscriptionState>, target: SubscriptionState) {
    tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("state {} not reached", target))
        .unwrap();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

mod reconnect_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reaches_streaming_after_failed_attempts() {
        let source = ScriptedSource::new(vec![Step::Fail, Step::Fail, Step::Fail, Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let stats = subscription.stats();
        let shutdown = CancellationToken::new();

        let start = Instant::now();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        let elapsed = start.elapsed();

        // Three constant back-off cycles, no growth
        assert!(elapsed >= DELAY * 3, "elapsed {:?}", elapsed);
        assert!(elapsed < DELAY * 4, "elapsed {:?}", elapsed);
        assert_eq!(source.connects(), 4);
        assert_eq!(stats.snapshot().connection_failures, 3);

        shutdown.cancel();
        let final_stats = handle.await.unwrap();

        assert_eq!(*state.borrow(), SubscriptionState::Stopped);
        assert_eq!(final_stats.sessions_opened, 1);
        assert_eq!(final_stats.stream_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let source = ScriptedSource::new(vec![]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(subscription.run(shutdown.clone()));
        wait_for_state(&mut state, SubscriptionState::Backoff).await;

        let start = Instant::now();
        shutdown.cancel();
        handle.await.unwrap();

        assert!(start.elapsed() < DELAY);
        assert_eq!(*state.borrow(), SubscriptionState::Stopped);

        tokio::time::advance(DELAY * 10).await;
        assert_eq!(source.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_indefinitely_with_constant_delay() {
        let source = ScriptedSource::new(vec![]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let shutdown = CancellationToken::new();

        let start = Instant::now();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        let probe = source.clone();
        eventually(|| probe.connects() >= 20).await;
        let elapsed = start.elapsed();

        // 19 complete back-off cycles separate 20 attempts
        assert!(elapsed >= DELAY * 19, "elapsed {:?}", elapsed);
        assert!(elapsed < DELAY * 21, "elapsed {:?}", elapsed);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_preempts_pending_connect() {
        let store = CounterStore::new().unwrap();
        let subscription = build(Arc::new(HangingSource), &store);
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(subscription.run(shutdown.clone()));
        wait_for_state(&mut state, SubscriptionState::Connecting).await;

        shutdown.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(*state.borrow(), SubscriptionState::Stopped);
        assert_eq!(stats.sessions_opened, 0);
        assert_eq!(stats.connection_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_connects() {
        let source = ScriptedSource::new(vec![Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        subscription.run(shutdown).await;

        assert_eq!(source.connects(), 0);
    }
}

mod streaming_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_event_increments_labelled_counter() {
        let source = ScriptedSource::new(vec![Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        assert!(
            source
                .sender(0)
                .send_event(exit_event("a1b2c3d4e5f6a7b8", "web", "nginx:latest", "137"))
                .await
        );

        let key = MetricKey::new("nginx:latest", "web", "137");
        let probe = store.clone();
        eventually(|| probe.get(&key) == 1).await;

        let text = store.encode_text().unwrap();
        assert!(text.contains(
            r#"docker_events{container_image="nginx:latest",container_name="web",exit_code="137"} 1"#
        ));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_delivery_counted_once() {
        let source = ScriptedSource::new(vec![Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let stats = subscription.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        let sender = source.sender(0);
        for i in 0..5 {
            // Different containers, same derived labels
            let id = format!("{:016x}", i);
            sender
                .send_event(
                    exit_event(&id, "worker", "app:1", "1").with_attribute("execDuration", "3"),
                )
                .await;
        }
        sender
            .send_event(RawEvent::new("0123456789abcdef").with_origin("redis:6"))
            .await;

        eventually(|| stats.snapshot().events_processed == 6).await;

        assert_eq!(store.get(&MetricKey::new("app:1", "worker", "1")), 5);
        assert_eq!(
            store.get(&MetricKey::new("redis:6", "0123456789ab", "unknown")),
            1
        );
        assert_eq!(store.len(), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_moves_to_backoff_and_keeps_counts() {
        let source = ScriptedSource::new(vec![Step::Open, Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let stats = subscription.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        let first = source.sender(0);
        first.send_event(exit_event("c1", "web", "nginx", "0")).await;
        first.send_event(exit_event("c2", "web", "nginx", "0")).await;
        first
            .send_error(EventSourceError::Transport("unexpected EOF".to_string()))
            .await;

        let start = Instant::now();
        wait_for_state(&mut state, SubscriptionState::Backoff).await;
        assert!(start.elapsed() < DELAY);

        // Events delivered ahead of the error were all counted
        let web = MetricKey::new("nginx", "web", "0");
        assert_eq!(store.get(&web), 2);
        assert_eq!(stats.snapshot().stream_failures, 1);

        // The failed session was released
        assert!(first.is_closed());

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        assert_eq!(source.connects(), 2);

        source.sender(1).send_event(exit_event("c3", "web", "nginx", "0")).await;
        let probe = store.clone();
        eventually(|| probe.get(&web) == 3).await;

        shutdown.cancel();
        let final_stats = handle.await.unwrap();
        assert_eq!(final_stats.sessions_opened, 2);
        assert_eq!(final_stats.events_processed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_reconnects_after_backoff() {
        let source = ScriptedSource::new(vec![Step::Open, Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let stats = subscription.stats();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        source
            .sender(0)
            .send_event(exit_event("c1", "web", "nginx", "0"))
            .await;
        // Producer goes away without reporting an error
        source.close_sessions();

        wait_for_state(&mut state, SubscriptionState::Backoff).await;
        assert_eq!(stats.snapshot().stream_failures, 1);
        assert_eq!(store.get(&MetricKey::new("nginx", "web", "0")), 1);

        let start = Instant::now();
        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        assert!(start.elapsed() >= DELAY);
        assert_eq!(source.connects(), 2);

        // The replacement session is counted as usual
        source
            .sender(0)
            .send_event(exit_event("c2", "web", "nginx", "0"))
            .await;
        let probe = store.clone();
        eventually(|| probe.get(&MetricKey::new("nginx", "web", "0")) == 2).await;

        shutdown.cancel();
        let final_stats = handle.await.unwrap();
        assert_eq!(final_stats.sessions_opened, 2);
        assert_eq!(final_stats.stream_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_sent_before_close_is_reported() {
        let source = ScriptedSource::new(vec![Step::Open]);
        let store = CounterStore::new().unwrap();
        let health = HealthRegistry::new();
        let subscription = SubscriptionLoopBuilder::new()
            .source(source.clone())
            .store(store.clone())
            .reconnect_delay(DELAY)
            .health(health.clone())
            .build()
            .unwrap();
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        source
            .sender(0)
            .send_error(EventSourceError::Transport("unexpected EOF".to_string()))
            .await;
        source.close_sessions();

        wait_for_state(&mut state, SubscriptionState::Backoff).await;
        let component = health.component(components::EVENT_STREAM).await.unwrap();
        assert_eq!(component.status, ComponentStatus::Degraded);
        assert!(component.message.unwrap().contains("unexpected EOF"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_streaming_releases_session() {
        let source = ScriptedSource::new(vec![Step::Open]);
        let store = CounterStore::new().unwrap();
        let subscription = build(source.clone(), &store);
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        let sender = source.sender(0);

        shutdown.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(*state.borrow(), SubscriptionState::Stopped);
        assert!(sender.is_closed());
        assert_eq!(stats.stream_failures, 0);
        assert_eq!(source.connects(), 1);
    }
}

mod health_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_degraded_until_first_session() {
        let store = CounterStore::new().unwrap();
        let health = HealthRegistry::new();
        health.register(components::EVENT_STREAM).await;
        let subscription = SubscriptionLoopBuilder::new()
            .source(Arc::new(HangingSource))
            .store(store)
            .health(health.clone())
            .build()
            .unwrap();
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Connecting).await;
        let component = health.component(components::EVENT_STREAM).await.unwrap();
        assert_eq!(component.status, ComponentStatus::Degraded);
        assert_eq!(component.message.as_deref(), Some(STREAM_CONNECTING));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_health_follows_connection() {
        let source = ScriptedSource::new(vec![Step::Fail, Step::Open]);
        let store = CounterStore::new().unwrap();
        let health = HealthRegistry::new();
        let subscription = SubscriptionLoopBuilder::new()
            .source(source.clone())
            .store(store.clone())
            .reconnect_delay(DELAY)
            .health(health.clone())
            .build()
            .unwrap();
        let mut state = subscription.state();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(subscription.run(shutdown.clone()));

        wait_for_state(&mut state, SubscriptionState::Backoff).await;
        let component = health.component(components::EVENT_STREAM).await.unwrap();
        assert_eq!(component.status, ComponentStatus::Degraded);
        assert!(component.message.unwrap().contains("connection refused"));

        wait_for_state(&mut state, SubscriptionState::Streaming).await;
        let component = health.component(components::EVENT_STREAM).await.unwrap();
        assert_eq!(component.status, ComponentStatus::Healthy);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

mod builder_tests {
    use super::*;

    #[test]
    fn test_builder_requires_source() {
        let store = tokio_test::assert_ok!(CounterStore::new());
        let result = SubscriptionLoopBuilder::new().store(store).build();

        assert_eq!(result.err(), Some(SubscriptionError::MissingSource));
    }

    #[test]
    fn test_builder_requires_store() {
        let result = SubscriptionLoopBuilder::new()
            .source(ScriptedSource::new(vec![]))
            .build();

        assert_eq!(result.err(), Some(SubscriptionError::MissingStore));
    }

    #[test]
    fn test_new_loop_starts_idle() {
        let store = CounterStore::new().unwrap();
        let subscription = build(ScriptedSource::new(vec![]), &store);

        assert_eq!(*subscription.state().borrow(), SubscriptionState::Idle);
    }
}
