//! Cancellable delayed execution.
//!
//! Every retry and reconnect loop in this crate schedules its next attempt
//! through a [`Scheduler`]. A [`ScheduleHandle`] carries a single `armed`
//! flag that both `cancel` and the timer firing swap out, so exactly one of
//! them wins and a cancelled callback never runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{ConnectivityError, Result};

/// Callback run when a scheduled delay elapses.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Timer facility used by the retry loops.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay` unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle;
}

/// Opaque handle to one scheduled callback.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    armed: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl ScheduleHandle {
    fn armed() -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(true)),
            abort: None,
        }
    }

    /// Disarm the callback. Idempotent; safe after the delay has fired.
    ///
    /// Returns `true` if this call prevented the callback from running.
    pub fn cancel(&self) -> bool {
        let disarmed = self.armed.swap(false, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        disarmed
    }

    /// `true` while the callback has neither fired nor been cancelled.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    fn fire(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }
}

/// Holder for the single outstanding handle of one logical retry loop.
#[derive(Debug, Default)]
pub struct RetrySlot {
    pending: Option<ScheduleHandle>,
}

impl RetrySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle`, cancelling whatever was scheduled before it.
    pub fn replace(&mut self, handle: ScheduleHandle) {
        if let Some(previous) = self.pending.replace(handle) {
            previous.cancel();
        }
    }

    /// Cancel the outstanding handle, if any.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some_and(|handle| handle.cancel())
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(ScheduleHandle::is_armed)
    }
}

/// Scheduler backed by `tokio::time::sleep` on the given runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime the caller is running on.
    pub fn try_current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|error| ConnectivityError::Runtime(error.to_string()))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle {
        let mut handle = ScheduleHandle::armed();
        let timer = handle.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if timer.fire() {
                task();
            }
        });
        handle.abort = Some(join.abort_handle());
        handle
    }
}

struct ManualEntry {
    due: Duration,
    seq: u64,
    handle: ScheduleHandle,
    task: ScheduledTask,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    entries: Vec<ManualEntry>,
}

/// Virtual-clock scheduler. Nothing fires until [`advance`](Self::advance) moves time forward.
///
/// Callbacks run on the caller of `advance`, in due-time order, ties broken by
/// scheduling order.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since construction.
    pub fn now(&self) -> Duration {
        self.state.lock().map(|state| state.now).unwrap_or_default()
    }

    /// Number of callbacks still armed.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|entry| entry.handle.is_armed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Delay until the earliest armed callback, relative to the current virtual time.
    pub fn next_due_in(&self) -> Option<Duration> {
        let state = self.state.lock().ok()?;
        state
            .entries
            .iter()
            .filter(|entry| entry.handle.is_armed())
            .map(|entry| entry.due.saturating_sub(state.now))
            .min()
    }

    /// Move the clock forward by `by`, firing every armed callback that comes due.
    ///
    /// Returns the number of callbacks that ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now().saturating_add(by);
        let mut fired = 0;
        loop {
            let next = {
                let Ok(mut state) = self.state.lock() else {
                    return fired;
                };
                let position = state
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.due <= target)
                    .min_by_key(|(_, entry)| (entry.due, entry.seq))
                    .map(|(index, _)| index);
                match position {
                    Some(index) => {
                        let entry = state.entries.remove(index);
                        state.now = state.now.max(entry.due);
                        Some(entry)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            let Some(entry) = next else {
                return fired;
            };
            if entry.handle.fire() {
                (entry.task)();
                fired += 1;
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle {
        let handle = ScheduleHandle::armed();
        if let Ok(mut state) = self.state.lock() {
            let due = state.now.saturating_add(delay);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push(ManualEntry {
                due,
                seq,
                handle: handle.clone(),
                task,
            });
        }
        handle
    }
}
