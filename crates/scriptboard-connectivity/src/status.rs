//! Connection status and failure bookkeeping shared by the monitors.

use serde::Serialize;

/// Reachability status.
///
/// The health monitor moves between `Checking`, `Connected` and
/// `Disconnected`; the realtime client between `Connecting`, `Connected` and
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Checking,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consecutive failures of one probe or connection loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureState {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl FailureState {
    /// Count a failed attempt and return the new streak length.
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    /// Restart the backoff curve without forgetting the last error message.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
