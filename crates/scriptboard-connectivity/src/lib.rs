//! Connectivity resilience layer for the Scriptboard desktop client.
//!
//! This crate keeps the client informed of backend reachability and consumes
//! the backend's push channels:
//! - [`HealthMonitor`]: periodic `/health` probing with a backoff-driven circuit breaker
//! - [`RealtimeClient`]: auto-reconnecting orchestrator WebSocket with typed event dispatch
//! - [`CaptureStreamClient`]: user-driven SSE consumer for macro recording sessions
//!
//! All retry timers go through the [`Scheduler`] seam so tests can drive a
//! virtual clock with [`ManualScheduler`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

pub mod backoff;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod error;
pub mod health;
pub mod protocol;
pub mod realtime;
pub mod scheduler;
pub mod sse;
pub mod status;

pub use backoff::{BackoffPolicy, BackoffTable, ExponentialBackoff};
pub use cancel::CancellationToken;
pub use capture::{
    CaptureConfig, CaptureKind, CaptureSnapshot, CaptureState, CaptureStreamClient,
    CapturedEvent, TimedEvent, timeline,
};
pub use config::{BackendEndpoints, ConfigError, ConnectivityConfig};
pub use error::{ConnectivityError, Result};
pub use health::{
    CircuitState, HealthMonitor, HealthMonitorConfig, HealthProbe, HealthSnapshot, HttpHealthProbe,
};
pub use protocol::{EventKind, InboundFrame, OrchestratorEvent, parse_frame};
pub use realtime::{
    EventCallback, EventSubscriptions, RealtimeClient, RealtimeConfig, RealtimeSnapshot,
    RealtimeStats,
};
pub use scheduler::{ManualScheduler, RetrySlot, ScheduleHandle, Scheduler, TokioScheduler};
pub use status::{ConnectionStatus, FailureState};
