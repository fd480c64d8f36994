use std::path::PathBuf;
use thiserror::Error;

/// Rejected settings. Raised before anything is enqueued.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("destination url is required")]
    MissingDestination,

    #[error("invalid destination url {url:?}: {source}")]
    InvalidDestination {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported http method {0:?}")]
    InvalidMethod(String),

    #[error("upload rate refresh interval must be greater than zero")]
    InvalidRefreshInterval,

    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Why a single transfer ended in the `Failed` state.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    #[error("file {name:?} could not be read: {source}")]
    MalformedFile {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload cancelled")]
    Cancelled,

    #[error("transfer channel closed without reporting an outcome")]
    Abandoned,
}

impl From<reqwest::Error> for TransferError {
    fn from(value: reqwest::Error) -> Self {
        TransferError::TransferFailed(value.to_string())
    }
}
