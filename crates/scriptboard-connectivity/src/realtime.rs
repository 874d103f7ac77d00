//! Auto-reconnecting orchestrator WebSocket client.
//!
//! State machine: `disconnected -> connecting -> connected -> disconnected`
//! with a reconnect scheduled from the [`BackoffTable`] after every close.
//! Teardown cancels the token first, then the pending reconnect timer, then
//! closes the live socket, so the close it causes never schedules another attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::{BackoffPolicy, BackoffTable};
use crate::cancel::CancellationToken;
use crate::config::BackendEndpoints;
use crate::error::{ConnectivityError, Result};
use crate::protocol::{EventKind, InboundFrame, OrchestratorEvent, parse_frame, pong_frame};
use crate::scheduler::{RetrySlot, Scheduler, TokioScheduler};
use crate::status::{ConnectionStatus, FailureState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked for each dispatched event.
pub type EventCallback = Arc<dyn Fn(&OrchestratorEvent) + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Subscription table: event kind to callbacks, invoked in registration order.
#[derive(Clone, Default)]
pub struct EventSubscriptions {
    handlers: BTreeMap<EventKind, Vec<EventCallback>>,
    on_connect: Vec<ConnectCallback>,
    on_disconnect: Vec<DisconnectCallback>,
}

impl EventSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, kind: EventKind, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
        self
    }

    pub fn on_plan_added<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::PlanAdded, callback)
    }

    pub fn on_plan_updated<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::PlanUpdated, callback)
    }

    pub fn on_plan_deleted<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::PlanDeleted, callback)
    }

    pub fn on_stub_added<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::StubAdded, callback)
    }

    pub fn on_stub_updated<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::StubUpdated, callback)
    }

    pub fn on_stub_deleted<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::StubDeleted, callback)
    }

    pub fn on_workorder_added<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::WorkorderAdded, callback)
    }

    pub fn on_workorder_updated<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::WorkorderUpdated, callback)
    }

    pub fn on_workorder_deleted<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::WorkorderDeleted, callback)
    }

    pub fn on_project_added<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::ProjectAdded, callback)
    }

    pub fn on_project_removed<F>(self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::ProjectRemoved, callback)
    }

    /// Called each time a connection opens.
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect.push(Arc::new(callback));
        self
    }

    /// Called with the close reason each time an open connection drops.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_disconnect.push(Arc::new(callback));
        self
    }

    pub fn has_handlers(&self, kind: EventKind) -> bool {
        self.handlers.get(&kind).is_some_and(|handlers| !handlers.is_empty())
    }

    /// Invoke every callback registered for the event's kind. Returns the number invoked.
    fn dispatch(&self, event: &OrchestratorEvent) -> usize {
        let Some(handlers) = self.handlers.get(&event.kind) else {
            return 0;
        };
        for handler in handlers {
            handler(event);
        }
        handlers.len()
    }
}

impl fmt::Debug for EventSubscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.handlers.keys().map(|kind| kind.as_str()).collect();
        f.debug_struct("EventSubscriptions")
            .field("kinds", &kinds)
            .field("on_connect", &self.on_connect.len())
            .field("on_disconnect", &self.on_disconnect.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub backoff: BackoffTable,
    pub connect_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffTable::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealtimeSnapshot {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_in: Option<Duration>,
}

impl Default for RealtimeSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            next_retry_in: None,
        }
    }
}

/// Frame counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeStats {
    pub events_dispatched: u64,
    pub pings_answered: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    events_dispatched: AtomicU64,
    pings_answered: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Default)]
struct ClientState {
    failures: FailureState,
    retry_slot: RetrySlot,
    task: Option<JoinHandle<()>>,
}

struct ClientInner {
    url: Url,
    config: RealtimeConfig,
    subscriptions: EventSubscriptions,
    scheduler: Arc<dyn Scheduler>,
    runtime: Handle,
    token: CancellationToken,
    state: Mutex<ClientState>,
    status_tx: watch::Sender<RealtimeSnapshot>,
    counters: Counters,
}

/// Persistent orchestrator socket owned by one UI component.
///
/// Connecting starts on construction and reconnection is automatic until
/// [`shutdown`](Self::shutdown), [`close`](Self::close), or drop.
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Connect to `url` using tokio timers for reconnect delays.
    pub fn connect(
        url: Url,
        subscriptions: EventSubscriptions,
        config: RealtimeConfig,
    ) -> Result<Self> {
        let scheduler = TokioScheduler::try_current()?;
        Self::with_scheduler(url, subscriptions, config, Arc::new(scheduler))
    }

    /// Connect to the orchestrator socket derived from the backend base URL.
    pub fn from_endpoints(
        endpoints: &BackendEndpoints,
        subscriptions: EventSubscriptions,
        config: RealtimeConfig,
    ) -> Result<Self> {
        Self::connect(endpoints.realtime_url()?, subscriptions, config)
    }

    pub fn with_scheduler(
        url: Url,
        subscriptions: EventSubscriptions,
        config: RealtimeConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        let inner = ClientInner::new(url, subscriptions, config, scheduler)?;
        inner.launch_attempt();
        Ok(Self { inner })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn subscribe(&self) -> watch::Receiver<RealtimeSnapshot> {
        self.inner.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> RealtimeSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().status
    }

    pub fn stats(&self) -> RealtimeStats {
        self.inner.stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Stop reconnecting and close the live socket. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// [`shutdown`](Self::shutdown), then wait for the connection task to finish
    /// so the Close frame has been sent.
    pub async fn close(&self) {
        self.inner.shutdown();
        let task = self.inner.lock_state().task.take();
        if let Some(task) = task
            && timeout(self.inner.config.connect_timeout, task).await.is_err()
        {
            debug!(url = %self.inner.url, "realtime connection task did not finish in time");
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ClientInner {
    fn new(
        url: Url,
        subscriptions: EventSubscriptions,
        config: RealtimeConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>> {
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConnectivityError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        let runtime =
            Handle::try_current().map_err(|error| ConnectivityError::Runtime(error.to_string()))?;
        let (status_tx, _) = watch::channel(RealtimeSnapshot::default());
        Ok(Arc::new(Self {
            url,
            config,
            subscriptions,
            scheduler,
            runtime,
            token: CancellationToken::new(),
            state: Mutex::new(ClientState::default()),
            status_tx,
            counters: Counters::default(),
        }))
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> RealtimeStats {
        RealtimeStats {
            events_dispatched: self.counters.events_dispatched.load(Ordering::Relaxed),
            pings_answered: self.counters.pings_answered.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
        }
    }

    fn launch_attempt(self: &Arc<Self>) {
        if self.token.is_cancelled() {
            return;
        }
        let task = self.runtime.spawn(Arc::clone(self).run_connection());
        self.lock_state().task = Some(task);
    }

    /// Publish `Connecting` unless the client was shut down before the attempt ran.
    fn begin_attempt(&self) -> bool {
        let _state = self.lock_state();
        if self.token.is_cancelled() {
            return false;
        }
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Connecting;
            snapshot.next_retry_in = None;
        });
        true
    }

    async fn run_connection(self: Arc<Self>) {
        if !self.begin_attempt() {
            return;
        }
        debug!(url = %self.url, "realtime connecting");

        let connected = tokio::select! {
            biased;
            () = self.token.cancelled() => return,
            result = timeout(
                self.config.connect_timeout,
                connect_async(self.url.as_str()),
            ) => result,
        };
        let reason = match connected {
            Err(_) => format!(
                "connection timeout after {:?}",
                self.config.connect_timeout
            ),
            Ok(Err(error)) => ConnectivityError::WebSocket(error.to_string()).to_string(),
            Ok(Ok((stream, _response))) => {
                if !self.mark_open() {
                    return;
                }
                let reason = self.run_session(stream).await;
                if self.token.is_cancelled() {
                    return;
                }
                for callback in &self.subscriptions.on_disconnect {
                    callback(&reason);
                }
                reason
            }
        };
        self.schedule_reconnect(reason);
    }

    fn mark_open(&self) -> bool {
        {
            let mut state = self.lock_state();
            if self.token.is_cancelled() {
                return false;
            }
            state.failures.record_success();
            self.status_tx.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Connected;
                snapshot.reconnect_attempts = 0;
                snapshot.last_error = None;
                snapshot.next_retry_in = None;
            });
        }
        info!(url = %self.url, "realtime connected");
        for callback in &self.subscriptions.on_connect {
            callback();
        }
        true
    }

    /// Pump one open socket until it closes. Returns the close reason.
    async fn run_session(&self, stream: WsStream) -> String {
        let (mut writer, mut reader) = stream.split();
        loop {
            let frame = tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    return "client closed".to_string();
                }
                frame = reader.next() => frame,
            };
            match frame {
                None => return "connection closed".to_string(),
                Some(Err(error)) => {
                    return ConnectivityError::WebSocket(error.to_string()).to_string();
                }
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = self.handle_text(text.as_str()) else {
                        continue;
                    };
                    if let Err(error) = writer.send(Message::Text(reply.into())).await {
                        return ConnectivityError::WebSocket(error.to_string()).to_string();
                    }
                    self.counters.pings_answered.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            format!("closed by server: {}", frame.reason)
                        }
                        _ => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
            }
        }
    }

    /// Handle one text frame. Returns the reply to send, if any.
    ///
    /// Parse failures and unknown types are dropped here and never end the session.
    fn handle_text(&self, text: &str) -> Option<String> {
        if self.token.is_cancelled() {
            return None;
        }
        match parse_frame(text) {
            Ok(InboundFrame::Ping) => Some(pong_frame()),
            Ok(InboundFrame::Event(event)) => {
                let invoked = self.subscriptions.dispatch(&event);
                if invoked == 0 {
                    debug!(kind = %event.kind, "realtime event has no subscriber");
                } else {
                    self.counters
                        .events_dispatched
                        .fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            Ok(InboundFrame::Unknown(frame_type)) => {
                warn!(
                    url = %self.url,
                    frame_type = %frame_type,
                    "unknown realtime event type dropped"
                );
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(error) => {
                warn!(url = %self.url, error = %error, "malformed realtime frame dropped");
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, reason: String) {
        let (attempt, delay) = {
            let mut state = self.lock_state();
            if self.token.is_cancelled() {
                return;
            }
            let attempt = state.failures.record_failure(reason.clone());
            let delay = self.config.backoff.delay(attempt);
            let weak: Weak<Self> = Arc::downgrade(self);
            let token = self.token.clone();
            let handle = self.scheduler.schedule(
                delay,
                Box::new(move || {
                    if token.is_cancelled() {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.launch_attempt();
                    }
                }),
            );
            state.retry_slot.replace(handle);
            self.status_tx.send_modify(|snapshot| {
                snapshot.status = ConnectionStatus::Disconnected;
                snapshot.reconnect_attempts = attempt;
                snapshot.last_error = Some(reason.clone());
                snapshot.next_retry_in = Some(delay);
            });
            (attempt, delay)
        };
        warn!(
            url = %self.url,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "realtime connection lost, reconnect scheduled"
        );
    }

    fn shutdown(&self) {
        if !self.token.cancel() {
            return;
        }
        self.lock_state().retry_slot.cancel();
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Disconnected;
            snapshot.next_retry_in = None;
        });
        debug!(url = %self.url, "realtime client shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use url::Url;

    use super::{ClientInner, EventSubscriptions, RealtimeClient, RealtimeConfig};
    use crate::protocol::EventKind;
    use crate::scheduler::{ManualScheduler, Scheduler};
    use crate::status::ConnectionStatus;

    fn offline_inner(
        subscriptions: EventSubscriptions,
        scheduler: &Arc<ManualScheduler>,
    ) -> Arc<ClientInner> {
        let scheduler: Arc<dyn Scheduler> = Arc::<ManualScheduler>::clone(scheduler);
        ClientInner::new(
            Url::parse("ws://127.0.0.1:9/orchestrator/ws").expect("url"),
            subscriptions,
            RealtimeConfig::default(),
            scheduler,
        )
        .expect("client inner")
    }

    #[tokio::test]
    async fn ping_is_answered_and_never_dispatched() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut subscriptions = EventSubscriptions::new();
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            subscriptions = subscriptions.on(kind, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        let inner = offline_inner(subscriptions, &Arc::new(ManualScheduler::new()));

        for _ in 0..3 {
            assert_eq!(
                inner.handle_text(r#"{"type":"ping"}"#).as_deref(),
                Some(r#"{"type":"pong"}"#)
            );
        }
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(inner.stats().events_dispatched, 0);
    }

    #[tokio::test]
    async fn events_reach_only_matching_callbacks_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&calls);
        let second = Arc::clone(&calls);
        let other = Arc::clone(&calls);
        let subscriptions = EventSubscriptions::new()
            .on_plan_added(move |event| {
                first
                    .lock()
                    .expect("calls lock")
                    .push(format!("first:{}", event.file_path.as_deref().unwrap_or("")));
            })
            .on_plan_added(move |_| second.lock().expect("calls lock").push("second".into()))
            .on_stub_deleted(move |_| other.lock().expect("calls lock").push("stub".into()));
        let inner = offline_inner(subscriptions, &Arc::new(ManualScheduler::new()));

        assert_eq!(inner.handle_text(r#"{"type":"plan_added","file_path":"/x"}"#), None);
        assert_eq!(
            *calls.lock().expect("calls lock"),
            vec!["first:/x".to_string(), "second".to_string()]
        );
        assert_eq!(inner.stats().events_dispatched, 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_dropped_without_error() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscriptions = EventSubscriptions::new().on_plan_added(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let inner = offline_inner(subscriptions, &Arc::new(ManualScheduler::new()));

        assert_eq!(inner.handle_text(r#"{"type":"unknown_x"}"#), None);
        assert_eq!(inner.handle_text("{not json"), None);
        assert_eq!(inner.handle_text(r#"["plan_added"]"#), None);
        assert_eq!(inner.handle_text(r#"{"type":"project_added"}"#), None);

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        let stats = inner.stats();
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.events_dispatched, 0);
    }

    #[tokio::test]
    async fn reconnect_delays_follow_the_table_with_one_outstanding_timer() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = offline_inner(EventSubscriptions::new(), &scheduler);

        let mut delays = Vec::new();
        for _ in 0..7 {
            inner.schedule_reconnect("connection refused".to_string());
            assert_eq!(scheduler.pending(), 1);
            delays.push(scheduler.next_due_in().expect("pending reconnect").as_millis());
        }
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
        let snapshot = inner.status_tx.borrow().clone();
        assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.reconnect_attempts, 7);
        assert_eq!(snapshot.last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn opening_resets_the_attempt_counter() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = offline_inner(EventSubscriptions::new(), &scheduler);
        inner.schedule_reconnect("refused".to_string());
        inner.schedule_reconnect("refused".to_string());

        assert!(inner.mark_open());
        let snapshot = inner.status_tx.borrow().clone();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.reconnect_attempts, 0);

        inner.schedule_reconnect("dropped".to_string());
        assert_eq!(scheduler.next_due_in(), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn shutdown_cancels_the_pending_reconnect_and_silences_late_events() {
        let scheduler = Arc::new(ManualScheduler::new());
        let inner = offline_inner(EventSubscriptions::new(), &scheduler);
        inner.schedule_reconnect("refused".to_string());
        assert_eq!(scheduler.pending(), 1);

        inner.shutdown();
        inner.shutdown();
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(60)), 0);

        let before = inner.status_tx.borrow().clone();
        inner.schedule_reconnect("late close".to_string());
        assert!(!inner.mark_open());
        assert_eq!(inner.handle_text(r#"{"type":"ping"}"#), None);
        assert_eq!(*inner.status_tx.borrow(), before);
        assert_eq!(scheduler.pending(), 0);
    }

    fn offline_client(scheduler: &Arc<ManualScheduler>) -> RealtimeClient {
        let scheduler: Arc<dyn Scheduler> = Arc::<ManualScheduler>::clone(scheduler);
        RealtimeClient::with_scheduler(
            Url::parse("ws://127.0.0.1:9/orchestrator/ws").expect("url"),
            EventSubscriptions::new(),
            RealtimeConfig::default(),
            scheduler,
        )
        .expect("client")
    }

    #[tokio::test]
    async fn shutdown_before_the_first_attempt_runs_leaves_status_untouched() {
        let scheduler = Arc::new(ManualScheduler::new());
        let client = offline_client(&scheduler);
        let mut rx = client.subscribe();

        client.shutdown();
        assert_eq!(rx.borrow_and_update().status, ConnectionStatus::Disconnected);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(!rx.has_changed().expect("client alive"));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn dropping_the_client_during_backoff_cancels_the_reconnect() {
        let scheduler = Arc::new(ManualScheduler::new());
        let client = offline_client(&scheduler);
        let mut rx = client.subscribe();

        let waiting = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|snapshot| snapshot.reconnect_attempts == 1),
        )
        .await
        .expect("first attempt should fail")
        .expect("client alive")
        .clone();
        assert_eq!(waiting.status, ConnectionStatus::Disconnected);
        assert_eq!(waiting.next_retry_in, Some(Duration::from_secs(1)));
        assert_eq!(scheduler.pending(), 1);

        drop(client);
        let last = rx.borrow_and_update().clone();
        assert_eq!(last.next_retry_in, None);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(60)), 0);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*rx.borrow(), last);
        assert!(!matches!(rx.has_changed(), Ok(true)));
    }

    #[tokio::test]
    async fn client_rejects_non_websocket_urls() {
        let result = RealtimeClient::connect(
            Url::parse("http://localhost:8000/orchestrator/ws").expect("url"),
            EventSubscriptions::new(),
            RealtimeConfig::default(),
        );
        assert!(result.is_err());
    }
}
