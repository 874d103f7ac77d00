//! Retry delay curves.

use std::time::Duration;

/// Maps a consecutive-failure count to the delay before the next attempt.
///
/// Implementations are monotonically non-decreasing in `failures` and capped.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, failures: u32) -> Duration;
}

/// Continuous curve `min(base * 2^(n-1), cap)`, used by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
}

impl ExponentialBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let cap = self.cap.max(self.base);
        let exponent = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1_u32 << exponent).min(cap)
    }
}

/// Fixed step table indexed by attempt, clamped to the last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffTable {
    steps: Vec<Duration>,
}

impl BackoffTable {
    /// Build a table. Returns `None` when empty or decreasing.
    pub fn new(steps: Vec<Duration>) -> Option<Self> {
        if steps.is_empty() || steps.windows(2).any(|pair| pair[1] < pair[0]) {
            return None;
        }
        Some(Self { steps })
    }

    pub fn from_millis(steps: &[u64]) -> Option<Self> {
        Self::new(steps.iter().copied().map(Duration::from_millis).collect())
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self {
            steps: [1, 2, 4, 8, 16, 30]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl BackoffPolicy for BackoffTable {
    /// Attempt `n` (1-based) waits `steps[min(n - 1, last)]`.
    fn delay(&self, failures: u32) -> Duration {
        let last = self.steps.len().saturating_sub(1);
        let index = (failures.saturating_sub(1) as usize).min(last);
        self.steps.get(index).copied().unwrap_or_default()
    }
}
