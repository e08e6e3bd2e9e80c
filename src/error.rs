//! Error types for the load generator.
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup failures. Any of these stops the run before a single attempt is made.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("target host is not set, pass --host or TARGET_HOST")]
    MissingHost,

    #[error("invalid target url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{name} must be a positive, finite number of seconds (got {value})")]
    InvalidDuration { name: &'static str, value: f64 },

    #[error("{name} must be positive (got {value})")]
    InvalidRate { name: &'static str, value: f64 },

    #[error("dictionary sample range {min}..={max} is invalid, need 1 <= min <= max")]
    InvalidSampleRange { min: usize, max: usize },

    #[error("sensitivity ratio must be within 0..=100 (got {0})")]
    InvalidRatio(u8),

    #[error("user count must be at least 1")]
    NoUsers,

    #[error("bearer token is not a valid header value")]
    InvalidToken,

    #[error("failed to read dictionary {path:?}: {source}")]
    Dictionary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Failures of a single attempt. Each one is reported as a `chat_stream_error` event.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("connect failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream broken: {0}")]
    Body(#[source] reqwest::Error),

    #[error("HTTP {}, body={body}", .status.as_u16())]
    Http { status: StatusCode, body: String },

    #[error("failed to encode request: {0}")]
    Encode(#[from] sonic_rs::Error),
}

impl AttemptError {
    /// Network-level failure from `send()`, split by whether the dial itself failed.
    pub fn from_send(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect(err)
        } else {
            Self::Request(err)
        }
    }

    /// Short, low-cardinality label used to group failures in the summary.
    pub fn label(&self) -> String {
        match self {
            Self::Connect(_) => "connect".to_string(),
            Self::Request(_) => "request".to_string(),
            Self::Timeout(_) => "read timeout".to_string(),
            Self::Body(_) => "stream broken".to_string(),
            Self::Http { status, .. } => format!("HTTP {}", status.as_u16()),
            Self::Encode(_) => "encode".to_string(),
        }
    }
}
