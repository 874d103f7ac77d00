//! Client error types.

use thiserror::Error;

/// Connectivity error type.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("unexpected status {status} from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<reqwest::Error> for ConnectivityError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else {
            Self::Http(error.to_string())
        }
    }
}

/// Connectivity result type.
pub type Result<T> = std::result::Result<T, ConnectivityError>;
