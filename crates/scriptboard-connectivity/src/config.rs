//! Backend endpoint derivation and environment configuration.

use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::backoff::{BackoffTable, ExponentialBackoff};
use crate::capture::CaptureConfig;
use crate::error::{ConnectivityError, Result};
use crate::health::HealthMonitorConfig;
use crate::realtime::RealtimeConfig;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

const HEALTH_PATH: &str = "health";
const REALTIME_PATH: &str = "orchestrator/ws";
const CAPTURE_STREAM_PATH: &str = "macros/record/stream";
const CAPTURE_START_PATH: &str = "macros/record/start";
const CAPTURE_STOP_PATH: &str = "macros/record/stop";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid SCRIPTBOARD_BACKEND_URL: {0}")]
    InvalidBackendUrl(String),
    #[error("invalid SCRIPTBOARD_HEALTH_INTERVAL_MS: {0}")]
    InvalidHealthIntervalMs(String),
    #[error("invalid SCRIPTBOARD_HEALTH_BACKOFF_BASE_MS: {0}")]
    InvalidHealthBackoffBaseMs(String),
    #[error("invalid SCRIPTBOARD_HEALTH_BACKOFF_CAP_MS: {0}")]
    InvalidHealthBackoffCapMs(String),
    #[error("invalid SCRIPTBOARD_HEALTH_FAILURE_THRESHOLD: {0}")]
    InvalidHealthFailureThreshold(String),
    #[error("invalid SCRIPTBOARD_HEALTH_TIMEOUT_MS: {0}")]
    InvalidHealthTimeoutMs(String),
    #[error("invalid SCRIPTBOARD_REALTIME_BACKOFF_MS: {0}")]
    InvalidRealtimeBackoffMs(String),
    #[error("invalid SCRIPTBOARD_REALTIME_CONNECT_TIMEOUT_MS: {0}")]
    InvalidRealtimeConnectTimeoutMs(String),
    #[error("invalid SCRIPTBOARD_CAPTURE_CONTROL: {0}")]
    InvalidCaptureControl(String),
}

/// Every backend URL this crate talks to, derived from one base URL.
///
/// A path prefix on the base (`https://host/api`) is preserved in each derived URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoints {
    base: Url,
}

impl BackendEndpoints {
    pub fn parse(raw: &str) -> std::result::Result<Self, ConfigError> {
        let base = Url::parse(raw.trim())
            .map_err(|error| ConfigError::InvalidBackendUrl(format!("{raw}: {error}")))?;
        Self::new(base)
    }

    pub fn new(base: Url) -> std::result::Result<Self, ConfigError> {
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBackendUrl(format!(
                "{base}: scheme must be http or https"
            )));
        }
        if base.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidBackendUrl(format!("{base}: missing host")));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn health_url(&self) -> Url {
        self.join(HEALTH_PATH)
    }

    /// Orchestrator socket URL with the scheme mapped `http -> ws`, `https -> wss`.
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.join(REALTIME_PATH);
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|()| {
            ConnectivityError::InvalidUrl(format!("cannot rewrite {url} to {scheme}"))
        })?;
        Ok(url)
    }

    pub fn capture_stream_url(&self) -> Url {
        self.join(CAPTURE_STREAM_PATH)
    }

    pub fn capture_start_url(&self) -> Url {
        self.join(CAPTURE_START_PATH)
    }

    pub fn capture_stop_url(&self) -> Url {
        self.join(CAPTURE_STOP_PATH)
    }

    fn join(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/{path}"));
        url.set_query(None);
        url.set_fragment(None);
        url
    }
}

/// Settings for all three connectivity components.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    pub endpoints: BackendEndpoints,
    pub health: HealthMonitorConfig,
    pub realtime: RealtimeConfig,
    pub capture: CaptureConfig,
}

impl ConnectivityConfig {
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let backend_url = non_empty(&lookup, "SCRIPTBOARD_BACKEND_URL")
            .or_else(|| non_empty(&lookup, "BACKEND_URL"))
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let endpoints = BackendEndpoints::parse(&backend_url)?;

        let healthy_interval_ms = parse_u64_lookup(
            &lookup,
            "SCRIPTBOARD_HEALTH_INTERVAL_MS",
            30_000,
            1_000,
            3_600_000,
            ConfigError::InvalidHealthIntervalMs,
        )?;
        let backoff_base_ms = parse_u64_lookup(
            &lookup,
            "SCRIPTBOARD_HEALTH_BACKOFF_BASE_MS",
            2_000,
            100,
            300_000,
            ConfigError::InvalidHealthBackoffBaseMs,
        )?;
        let backoff_cap_ms = parse_u64_lookup(
            &lookup,
            "SCRIPTBOARD_HEALTH_BACKOFF_CAP_MS",
            30_000,
            backoff_base_ms,
            3_600_000,
            ConfigError::InvalidHealthBackoffCapMs,
        )?;
        let failure_threshold = parse_u64_lookup(
            &lookup,
            "SCRIPTBOARD_HEALTH_FAILURE_THRESHOLD",
            5,
            1,
            1_000,
            ConfigError::InvalidHealthFailureThreshold,
        )?;
        let probe_timeout_ms = parse_u64_lookup(
            &lookup,
            "SCRIPTBOARD_HEALTH_TIMEOUT_MS",
            5_000,
            100,
            120_000,
            ConfigError::InvalidHealthTimeoutMs,
        )?;
        let reconnect_backoff = parse_backoff_table(&lookup, "SCRIPTBOARD_REALTIME_BACKOFF_MS")?;
        let connect_timeout_ms = parse_u64_lookup(
            &lookup,
            "SCRIPTBOARD_REALTIME_CONNECT_TIMEOUT_MS",
            10_000,
            100,
            120_000,
            ConfigError::InvalidRealtimeConnectTimeoutMs,
        )?;
        let session_control = parse_bool_lookup(&lookup, "SCRIPTBOARD_CAPTURE_CONTROL", true)
            .map_err(|error| {
                ConfigError::InvalidCaptureControl(format!("SCRIPTBOARD_CAPTURE_CONTROL: {error}"))
            })?;

        Ok(Self {
            endpoints,
            health: HealthMonitorConfig {
                healthy_interval: Duration::from_millis(healthy_interval_ms),
                backoff: ExponentialBackoff::new(
                    Duration::from_millis(backoff_base_ms),
                    Duration::from_millis(backoff_cap_ms),
                ),
                failure_threshold: u32::try_from(failure_threshold).unwrap_or(u32::MAX),
                probe_timeout: Duration::from_millis(probe_timeout_ms),
            },
            realtime: RealtimeConfig {
                backoff: reconnect_backoff,
                connect_timeout: Duration::from_millis(connect_timeout_ms),
            },
            capture: CaptureConfig {
                session_control,
                ..CaptureConfig::default()
            },
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
    invalid: fn(String) -> ConfigError,
) -> std::result::Result<u64, ConfigError> {
    match non_empty(lookup, key) {
        None => Ok(default.clamp(min, max)),
        Some(raw) => raw
            .parse::<u64>()
            .map(|value| value.clamp(min, max))
            .map_err(|error| invalid(format!("{raw}: {error}"))),
    }
}

fn parse_backoff_table(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> std::result::Result<BackoffTable, ConfigError> {
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(BackoffTable::default());
    };
    let steps = raw
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<u64>()
                .map(|ms| ms.clamp(10, 3_600_000))
                .map_err(|error| ConfigError::InvalidRealtimeBackoffMs(format!("{value}: {error}")))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    BackoffTable::from_millis(&steps).ok_or_else(|| {
        ConfigError::InvalidRealtimeBackoffMs(format!(
            "{raw}: must be non-empty and non-decreasing"
        ))
    })
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> std::result::Result<bool, String> {
    let Some(raw) = non_empty(lookup, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}
