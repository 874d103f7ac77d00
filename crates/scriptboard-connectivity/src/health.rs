//! Backend health monitor.
//!
//! Probes `/health` on a loop. While healthy the next probe is scheduled after
//! a fixed interval; after a failure it is scheduled after an exponential
//! backoff delay. Once the failure streak reaches the configured threshold the
//! circuit is reported as open, but probing continues at the capped interval
//! so recovery is still detected automatically. [`HealthMonitor::retry`] is the
//! half-open probe: it resets the curve and probes immediately.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::cancel::CancellationToken;
use crate::config::BackendEndpoints;
use crate::error::{ConnectivityError, Result};
use crate::scheduler::{RetrySlot, ScheduleHandle, Scheduler, TokioScheduler};
use crate::status::{ConnectionStatus, FailureState};

/// Liveness check against the backend.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// `GET {base}/health`; any 2xx status is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpHealthProbe {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> Result<()> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ConnectivityError::Status {
                status,
                url: self.url.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    /// Delay between probes while the backend is healthy.
    pub healthy_interval: Duration,
    pub backoff: ExponentialBackoff,
    /// Consecutive failures at which the circuit is reported open.
    pub failure_threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(30),
            backoff: ExponentialBackoff::default(),
            failure_threshold: 5,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Failure streak reached the threshold. Probing continues at the capped interval.
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub circuit: CircuitState,
    pub next_probe_in: Option<Duration>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub running: bool,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Checking,
            consecutive_failures: 0,
            last_error: None,
            circuit: CircuitState::Closed,
            next_probe_in: None,
            last_checked_at: None,
            running: false,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    session: Option<CancellationToken>,
    retry_slot: RetrySlot,
    in_flight: Option<AbortHandle>,
    failures: FailureState,
    epoch: u64,
    circuit_open: bool,
}

struct MonitorInner {
    probe: Arc<dyn HealthProbe>,
    scheduler: Arc<dyn Scheduler>,
    runtime: Handle,
    config: HealthMonitorConfig,
    state: Mutex<MonitorState>,
    status_tx: watch::Sender<HealthSnapshot>,
}

/// Periodic health prober owned by one UI component.
///
/// Dropping the monitor stops it.
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    /// Build a stopped monitor bound to the current tokio runtime.
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        scheduler: Arc<dyn Scheduler>,
        config: HealthMonitorConfig,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|error| ConnectivityError::Runtime(error.to_string()))?;
        let (status_tx, _) = watch::channel(HealthSnapshot::default());
        Ok(Self {
            inner: Arc::new(MonitorInner {
                probe,
                scheduler,
                runtime,
                config,
                state: Mutex::new(MonitorState::default()),
                status_tx,
            }),
        })
    }

    /// Monitor probing `{base}/health` over HTTP with tokio timers.
    pub fn http(endpoints: &BackendEndpoints, config: HealthMonitorConfig) -> Result<Self> {
        let probe = HttpHealthProbe::new(endpoints.health_url(), config.probe_timeout)?;
        let scheduler = TokioScheduler::try_current()?;
        Self::new(Arc::new(probe), Arc::new(scheduler), config)
    }

    /// Begin the probe loop with an immediate probe. No-op while running.
    pub fn start(&self) {
        let (token, epoch) = {
            let mut state = self.inner.lock_state();
            if state.session.is_some() {
                return;
            }
            let token = CancellationToken::new();
            state.session = Some(token.clone());
            state.epoch += 1;
            self.inner.status_tx.send_modify(|snapshot| snapshot.running = true);
            (token, state.epoch)
        };
        debug!(
            interval_ms = self.inner.config.healthy_interval.as_millis() as u64,
            "health monitor started"
        );
        self.inner.launch_probe(token, epoch);
    }

    /// Cancel the pending probe and discard any in-flight result. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.lock_state();
        let Some(token) = state.session.take() else {
            return;
        };
        token.cancel();
        state.epoch += 1;
        state.retry_slot.cancel();
        if let Some(in_flight) = state.in_flight.take() {
            in_flight.abort();
        }
        self.inner.status_tx.send_modify(|snapshot| {
            snapshot.running = false;
            snapshot.next_probe_in = None;
        });
        debug!("health monitor stopped");
    }

    /// Reset the failure streak and probe now, skipping any pending backoff wait.
    ///
    /// Starts the monitor if it was stopped.
    pub fn retry(&self) {
        let (token, epoch) = {
            let mut state = self.inner.lock_state();
            let token = state
                .session
                .get_or_insert_with(CancellationToken::new)
                .clone();
            state.epoch += 1;
            state.failures.reset();
            state.circuit_open = false;
            state.retry_slot.cancel();
            if let Some(in_flight) = state.in_flight.take() {
                in_flight.abort();
            }
            self.inner.status_tx.send_modify(|snapshot| {
                snapshot.consecutive_failures = 0;
                snapshot.circuit = CircuitState::Closed;
                snapshot.next_probe_in = None;
                snapshot.running = true;
            });
            (token, state.epoch)
        };
        info!("manual health retry");
        self.inner.launch_probe(token, epoch);
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.inner.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.status_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().status
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().session.is_some()
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.inner.config
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MonitorInner {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn launch_probe(self: &Arc<Self>, token: CancellationToken, epoch: u64) {
        let task = self.runtime.spawn(Arc::clone(self).run_probe(token.clone(), epoch));
        let mut state = self.lock_state();
        if !token.is_cancelled() && state.epoch == epoch {
            state.in_flight = Some(task.abort_handle());
        }
    }

    async fn run_probe(self: Arc<Self>, token: CancellationToken, epoch: u64) {
        if !self.begin_probe(&token, epoch) {
            return;
        }
        let outcome = self.probe.check().await;
        if token.is_cancelled() {
            return;
        }
        self.finish_probe(&token, epoch, outcome);
    }

    fn begin_probe(&self, token: &CancellationToken, epoch: u64) -> bool {
        let state = self.lock_state();
        if token.is_cancelled() || state.epoch != epoch {
            return false;
        }
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Checking;
            snapshot.next_probe_in = None;
        });
        true
    }

    fn finish_probe(self: &Arc<Self>, token: &CancellationToken, epoch: u64, outcome: Result<()>) {
        let mut state = self.lock_state();
        if token.is_cancelled() || state.epoch != epoch {
            return;
        }
        state.in_flight = None;

        let (status, delay) = match outcome {
            Ok(()) => {
                state.failures.record_success();
                if state.circuit_open {
                    info!("backend reachable again, circuit closed");
                }
                state.circuit_open = false;
                (ConnectionStatus::Connected, self.config.healthy_interval)
            }
            Err(error) => {
                let failures = state.failures.record_failure(error.to_string());
                let delay = self.config.backoff.delay(failures);
                debug!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "health probe failed"
                );
                if failures >= self.config.failure_threshold && !state.circuit_open {
                    state.circuit_open = true;
                    warn!(
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "backend unreachable, circuit open"
                    );
                }
                (ConnectionStatus::Disconnected, delay)
            }
        };

        let handle = self.schedule_probe(token.clone(), epoch, delay);
        state.retry_slot.replace(handle);

        let failures = state.failures.clone();
        let circuit = if state.circuit_open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        };
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = status;
            snapshot.consecutive_failures = failures.consecutive_failures;
            snapshot.last_error = failures.last_error;
            snapshot.circuit = circuit;
            snapshot.next_probe_in = Some(delay);
            snapshot.last_checked_at = Some(Utc::now());
        });
    }

    fn schedule_probe(
        self: &Arc<Self>,
        token: CancellationToken,
        epoch: u64,
        delay: Duration,
    ) -> ScheduleHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if token.is_cancelled() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.launch_probe(token, epoch);
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Notify, watch};

    use super::{CircuitState, HealthMonitor, HealthMonitorConfig, HealthProbe, HealthSnapshot};
    use crate::error::{ConnectivityError, Result};
    use crate::scheduler::{ManualScheduler, Scheduler};
    use crate::status::ConnectionStatus;

    #[derive(Default)]
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<bool>>,
        healthy_when_exhausted: bool,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedProbe {
        fn failing() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn scripted(outcomes: &[bool], healthy_when_exhausted: bool) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                healthy_when_exhausted,
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let healthy = self
                .outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or(self.healthy_when_exhausted);
            if healthy {
                Ok(())
            } else {
                Err(ConnectivityError::Http("connection refused".to_string()))
            }
        }
    }

    fn monitor(probe: Arc<ScriptedProbe>, scheduler: &Arc<ManualScheduler>) -> HealthMonitor {
        let scheduler: Arc<dyn Scheduler> = Arc::<ManualScheduler>::clone(scheduler);
        HealthMonitor::new(probe, scheduler, HealthMonitorConfig::default()).expect("monitor")
    }

    async fn wait_until(
        rx: &mut watch::Receiver<HealthSnapshot>,
        predicate: impl FnMut(&HealthSnapshot) -> bool,
    ) -> HealthSnapshot {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate))
            .await
            .expect("snapshot condition timed out")
            .expect("monitor alive")
            .clone()
    }

    #[tokio::test]
    async fn failures_back_off_exponentially_and_open_the_circuit_without_stopping() {
        let scheduler = Arc::new(ManualScheduler::new());
        let probe = ScriptedProbe::failing();
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();
        monitor.start();

        let expected_ms = [2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000];
        for (index, delay_ms) in expected_ms.into_iter().enumerate() {
            let failures = index as u32 + 1;
            let snapshot = wait_until(&mut rx, |s| s.consecutive_failures == failures).await;
            assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
            assert_eq!(snapshot.last_error.as_deref(), Some("HTTP error: connection refused"));
            assert_eq!(snapshot.next_probe_in, Some(Duration::from_millis(delay_ms)));
            assert_eq!(scheduler.next_due_in(), Some(Duration::from_millis(delay_ms)));
            let expected_circuit = if failures >= 5 {
                CircuitState::Open
            } else {
                CircuitState::Closed
            };
            assert_eq!(snapshot.circuit, expected_circuit);

            assert_eq!(scheduler.advance(Duration::from_millis(delay_ms)), 1);
        }
        wait_until(&mut rx, |s| s.consecutive_failures == 8).await;
        assert_eq!(probe.calls(), 8);
        assert!(monitor.is_running());
    }

    #[tokio::test]
    async fn success_resets_failures_and_uses_healthy_interval() {
        let scheduler = Arc::new(ManualScheduler::new());
        let probe = ScriptedProbe::scripted(&[false, false, false], true);
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();
        monitor.start();

        for (failures, delay_ms) in [(1, 2_000), (2, 4_000), (3, 8_000)] {
            wait_until(&mut rx, |s| s.consecutive_failures == failures).await;
            scheduler.advance(Duration::from_millis(delay_ms));
        }
        let snapshot = wait_until(&mut rx, |s| s.status == ConnectionStatus::Connected).await;
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.circuit, CircuitState::Closed);
        assert!(snapshot.last_checked_at.is_some());
        assert_eq!(scheduler.next_due_in(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn retry_probes_immediately_and_resets_the_curve() {
        let scheduler = Arc::new(ManualScheduler::new());
        let probe = ScriptedProbe::failing();
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();
        monitor.start();

        wait_until(&mut rx, |s| s.consecutive_failures == 1).await;
        scheduler.advance(Duration::from_secs(2));
        wait_until(&mut rx, |s| s.consecutive_failures == 2).await;
        assert_eq!(scheduler.next_due_in(), Some(Duration::from_secs(4)));

        monitor.retry();
        assert_eq!(monitor.snapshot().consecutive_failures, 0);
        assert_eq!(scheduler.pending(), 0);

        let snapshot = wait_until(&mut rx, |s| {
            s.consecutive_failures == 1 && s.status == ConnectionStatus::Disconnected
        })
        .await;
        assert_eq!(snapshot.next_probe_in, Some(Duration::from_secs(2)));
        assert_eq!(probe.calls(), 3);
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_pending_probe_and_later_fires_change_nothing() {
        let scheduler = Arc::new(ManualScheduler::new());
        let probe = ScriptedProbe::failing();
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();
        monitor.start();
        wait_until(&mut rx, |s| s.consecutive_failures == 1).await;

        monitor.stop();
        monitor.stop();
        let stopped = monitor.snapshot();
        assert!(!stopped.running);
        assert_eq!(scheduler.pending(), 0);

        assert_eq!(scheduler.advance(Duration::from_secs(120)), 0);
        tokio::task::yield_now().await;
        assert_eq!(probe.calls(), 1);
        assert_eq!(monitor.snapshot(), stopped);
    }

    #[tokio::test]
    async fn in_flight_probe_result_is_discarded_after_stop() {
        let scheduler = Arc::new(ManualScheduler::new());
        let gate = Arc::new(Notify::new());
        let probe = Arc::new(ScriptedProbe {
            gate: Some(Arc::clone(&gate)),
            ..ScriptedProbe::default()
        });
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();
        monitor.start();
        wait_until(&mut rx, |s| s.status == ConnectionStatus::Checking && s.running).await;
        while probe.calls() == 0 {
            tokio::task::yield_now().await;
        }

        monitor.stop();
        gate.notify_waiters();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Checking);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_retry_restarts_a_stopped_monitor() {
        let scheduler = Arc::new(ManualScheduler::new());
        let probe = ScriptedProbe::scripted(&[], true);
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();

        monitor.start();
        monitor.start();
        wait_until(&mut rx, |s| s.status == ConnectionStatus::Connected).await;
        assert_eq!(probe.calls(), 1);

        monitor.stop();
        assert!(!monitor.is_running());
        monitor.retry();
        assert!(monitor.is_running());
        wait_until(&mut rx, |s| s.running && s.last_checked_at.is_some()).await;
        while probe.calls() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn dropping_the_monitor_cancels_its_timer() {
        let scheduler = Arc::new(ManualScheduler::new());
        let probe = ScriptedProbe::failing();
        let monitor = monitor(Arc::clone(&probe), &scheduler);
        let mut rx = monitor.subscribe();
        monitor.start();
        wait_until(&mut rx, |s| s.consecutive_failures == 1).await;
        assert_eq!(scheduler.pending(), 1);

        drop(monitor);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.advance(Duration::from_secs(60)), 0);
        assert_eq!(probe.calls(), 1);
    }
}
