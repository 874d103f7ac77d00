//! Macro capture stream consumer.
//!
//! Recording is user driven: [`CaptureStreamClient::start_recording`] opens the
//! SSE stream and clears the previous log, [`CaptureStreamClient::stop_recording`]
//! closes it and returns what was captured. A `{"type":"done"}` message ends the
//! session from the server side.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cancel::CancellationToken;
use crate::config::BackendEndpoints;
use crate::error::{ConnectivityError, Result};
use crate::sse::SseDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureKind {
    KeyDown,
    KeyUp,
    ClipboardSet,
    Delay,
    WindowFocus,
    /// Kind added by a newer backend.
    #[serde(other)]
    Other,
}

/// One recorded input event. `ts_delta_ms` is relative to the previous event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedEvent {
    #[serde(rename = "type")]
    pub kind: CaptureKind,
    #[serde(default)]
    pub ts_delta_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipboard_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CaptureMessage {
    Event(CapturedEvent),
    Done { reason: Option<String> },
}

fn parse_capture_message(data: &str) -> Result<CaptureMessage> {
    let value: Value = serde_json::from_str(data)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectivityError::Protocol("missing capture event type".to_string()))?;
    if kind == "done" {
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        return Ok(CaptureMessage::Done { reason });
    }
    Ok(CaptureMessage::Event(serde_json::from_value(value)?))
}

/// Captured event placed on the wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimedEvent {
    pub at: DateTime<Utc>,
    pub event: CapturedEvent,
}

/// Place relative deltas on the wall clock so the last event lands on `now`.
///
/// The base is `now - sum(ts_delta_ms)`; each event sits at the base plus the
/// running sum up to and including it, so timestamps never decrease.
pub fn timeline(events: &[CapturedEvent], now: DateTime<Utc>) -> Vec<TimedEvent> {
    let total = events
        .iter()
        .fold(0_u64, |sum, event| sum.saturating_add(event.ts_delta_ms));
    let base = now
        .checked_sub_signed(millis(total))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut elapsed = 0_u64;
    events
        .iter()
        .map(|event| {
            elapsed = elapsed.saturating_add(event.ts_delta_ms);
            TimedEvent {
                at: base.checked_add_signed(millis(elapsed)).unwrap_or(now),
                event: event.clone(),
            }
        })
        .collect()
}

fn millis(value: u64) -> TimeDelta {
    i64::try_from(value)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Drive `POST /macros/record/{start,stop}` around the stream.
    pub session_control: bool,
    pub connect_timeout: Duration,
    pub control_timeout: Duration,
    /// Capacity of the live event fan-out channel.
    pub event_buffer: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            session_control: true,
            connect_timeout: Duration::from_secs(10),
            control_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Recording,
    /// The server sent the end-of-stream sentinel.
    Completed,
    /// The stream failed. Recording does not reconnect on its own.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSnapshot {
    pub state: CaptureState,
    pub event_count: usize,
    pub last_error: Option<String>,
    pub done_reason: Option<String>,
}

impl Default for CaptureSnapshot {
    fn default() -> Self {
        Self {
            state: CaptureState::Idle,
            event_count: 0,
            last_error: None,
            done_reason: None,
        }
    }
}

#[derive(Default)]
struct Session {
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    events: Vec<CapturedEvent>,
}

struct CaptureShared {
    session: Mutex<Session>,
    status_tx: watch::Sender<CaptureSnapshot>,
    events_tx: broadcast::Sender<CapturedEvent>,
}

impl CaptureShared {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, token: &CancellationToken, event: CapturedEvent) -> bool {
        let mut session = self.lock_session();
        if token.is_cancelled() {
            return false;
        }
        session.events.push(event.clone());
        let count = session.events.len();
        self.status_tx
            .send_modify(|snapshot| snapshot.event_count = count);
        let _ = self.events_tx.send(event);
        true
    }

    /// End the session owned by `token` in `state`.
    fn finish(
        &self,
        token: &CancellationToken,
        state: CaptureState,
        error: Option<String>,
        done_reason: Option<String>,
    ) {
        let mut session = self.lock_session();
        if !token.cancel() {
            return;
        }
        session.token = None;
        self.status_tx.send_modify(|snapshot| {
            snapshot.state = state;
            if error.is_some() {
                snapshot.last_error = error;
            }
            snapshot.done_reason = done_reason;
        });
    }
}

/// SSE consumer for one macro recording at a time.
pub struct CaptureStreamClient {
    endpoints: BackendEndpoints,
    config: CaptureConfig,
    client: reqwest::Client,
    shared: Arc<CaptureShared>,
}

impl CaptureStreamClient {
    pub fn new(endpoints: BackendEndpoints, config: CaptureConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let (status_tx, _) = watch::channel(CaptureSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Ok(Self {
            endpoints,
            config,
            client,
            shared: Arc::new(CaptureShared {
                session: Mutex::new(Session::default()),
                status_tx,
                events_tx,
            }),
        })
    }

    /// Open a fresh recording session, discarding previously captured events.
    ///
    /// A session already in progress is closed first. Failure to reach the
    /// record-start endpoint is recorded in the snapshot; failure to open the
    /// stream marks the session failed and is returned.
    pub async fn start_recording(&self) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut session = self.shared.lock_session();
            if let Some(previous) = session.token.replace(token.clone()) {
                previous.cancel();
            }
            if let Some(task) = session.task.take() {
                task.abort();
            }
            session.events.clear();
            self.shared.status_tx.send_replace(CaptureSnapshot {
                state: CaptureState::Recording,
                ..CaptureSnapshot::default()
            });
        }

        if self.config.session_control
            && let Err(error) = self.post_control(self.endpoints.capture_start_url()).await
        {
            warn!(error = %error, "record start request failed");
            if !token.is_cancelled() {
                self.shared
                    .status_tx
                    .send_modify(|snapshot| snapshot.last_error = Some(error.to_string()));
            }
        }
        if token.is_cancelled() {
            return Ok(());
        }

        let response = match self.open_stream().await {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "capture stream failed to open");
                self.shared
                    .finish(&token, CaptureState::Failed, Some(error.to_string()), None);
                return Err(error);
            }
        };

        let task = tokio::spawn(read_stream(
            Arc::clone(&self.shared),
            token.clone(),
            response,
        ));
        let mut session = self.shared.lock_session();
        if token.is_cancelled() {
            task.abort();
        } else {
            session.task = Some(task);
            info!(url = %self.endpoints.capture_stream_url(), "capture stream open");
        }
        Ok(())
    }

    /// Close the stream and return the captured events. Idempotent.
    pub async fn stop_recording(&self) -> Vec<CapturedEvent> {
        let (was_open, events) = {
            let mut session = self.shared.lock_session();
            let was_open = session.token.take().is_some_and(|token| token.cancel());
            if let Some(task) = session.task.take() {
                task.abort();
            }
            if was_open {
                self.shared
                    .status_tx
                    .send_modify(|snapshot| snapshot.state = CaptureState::Idle);
            }
            (was_open, session.events.clone())
        };

        if was_open {
            debug!(events = events.len(), "capture stream closed");
            if self.config.session_control
                && let Err(error) = self.post_control(self.endpoints.capture_stop_url()).await
            {
                warn!(error = %error, "record stop request failed");
                self.shared
                    .status_tx
                    .send_modify(|snapshot| snapshot.last_error = Some(error.to_string()));
            }
        }
        events
    }

    pub fn is_recording(&self) -> bool {
        self.shared.lock_session().token.is_some()
    }

    /// Empty the captured log without touching the stream.
    pub fn clear(&self) {
        self.shared.lock_session().events.clear();
        self.shared
            .status_tx
            .send_modify(|snapshot| snapshot.event_count = 0);
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.shared.lock_session().events.clone()
    }

    /// Live feed of events as they are appended.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CapturedEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureSnapshot> {
        self.shared.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> CaptureSnapshot {
        self.shared.status_tx.borrow().clone()
    }

    pub fn state(&self) -> CaptureState {
        self.shared.status_tx.borrow().state
    }

    async fn open_stream(&self) -> Result<reqwest::Response> {
        let url = self.endpoints.capture_stream_url();
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        ensure_success(response, &url)
    }

    async fn post_control(&self, url: Url) -> Result<()> {
        let response = self
            .client
            .post(url.clone())
            .timeout(self.config.control_timeout)
            .send()
            .await?;
        ensure_success(response, &url).map(|_| ())
    }
}

impl Drop for CaptureStreamClient {
    fn drop(&mut self) {
        let mut session = self.shared.lock_session();
        if let Some(token) = session.token.take() {
            token.cancel();
        }
        if let Some(task) = session.task.take() {
            task.abort();
        }
    }
}

fn ensure_success(response: reqwest::Response, url: &Url) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(ConnectivityError::Status {
            status,
            url: url.to_string(),
        })
    }
}

async fn read_stream(
    shared: Arc<CaptureShared>,
    token: CancellationToken,
    response: reqwest::Response,
) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = tokio::select! {
            biased;
            () = token.cancelled() => return,
            chunk = body.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(error)) => {
                let error = ConnectivityError::from(error);
                if !token.is_cancelled() {
                    warn!(error = %error, "capture stream failed");
                }
                shared.finish(&token, CaptureState::Failed, Some(error.to_string()), None);
                return;
            }
            None => {
                if !token.is_cancelled() {
                    warn!("capture stream ended without done event");
                }
                shared.finish(
                    &token,
                    CaptureState::Failed,
                    Some("stream closed before done event".to_string()),
                    None,
                );
                return;
            }
        };

        for message in decoder.push(&bytes) {
            if !message.is_message() {
                continue;
            }
            match parse_capture_message(&message.data) {
                Ok(CaptureMessage::Event(event)) => {
                    if !shared.append(&token, event) {
                        return;
                    }
                }
                Ok(CaptureMessage::Done { reason }) => {
                    debug!(reason = ?reason, "capture stream done");
                    shared.finish(&token, CaptureState::Completed, None, reason);
                    return;
                }
                Err(error) => {
                    warn!(error = %error, "malformed capture event dropped");
                }
            }
        }
    }
}
