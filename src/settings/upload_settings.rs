use crate::error::ConfigError;
use reqwest::Method;
use serde::Deserialize;
use std::{path::Path, time::Duration};
use url::Url;

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
pub const DEFAULT_UPLOAD_RATE_REFRESH_MS: u64 = 1000;
pub const DEFAULT_EXTENDED_MODE_TIMEOUT_MS: u64 = 2500;
const DEFAULT_METHOD: &str = "POST";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;
/// Appended to the destination to build the upload endpoint.
const UPLOAD_SUFFIX: &str = "upload";

/// Settings for one drop target, as written in a TOML file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadSettings {
    pub destination_url: String,
    pub method: String,
    pub max_concurrency: usize,
    pub upload_rate_refresh_interval_ms: u64,
    pub extended_mode_timeout_ms: u64,
    /// Dropped files start uploading immediately instead of waiting for a flush.
    pub direct_upload: bool,
    pub request_timeout_secs: u64,
    /// Finished tasks kept for snapshots once their batch has settled.
    pub history_limit: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            destination_url: String::new(),
            method: DEFAULT_METHOD.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            upload_rate_refresh_interval_ms: DEFAULT_UPLOAD_RATE_REFRESH_MS,
            extended_mode_timeout_ms: DEFAULT_EXTENDED_MODE_TIMEOUT_MS,
            direct_upload: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl UploadSettings {
    pub fn with_destination(destination_url: impl Into<String>) -> Self {
        Self {
            destination_url: destination_url.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks every field and resolves the endpoint. Fails fast so that a
    /// scheduler is never built from settings it cannot honour.
    pub fn validate(&self) -> Result<SchedulerConfig, ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrency));
        }
        if self.upload_rate_refresh_interval_ms == 0 {
            return Err(ConfigError::InvalidRefreshInterval);
        }
        let destination = self.destination_url.trim();
        if destination.is_empty() {
            return Err(ConfigError::MissingDestination);
        }
        let raw_endpoint = format!("{destination}{UPLOAD_SUFFIX}");
        let endpoint = Url::parse(&raw_endpoint).map_err(|source| {
            ConfigError::InvalidDestination {
                url: raw_endpoint.clone(),
                source,
            }
        })?;
        let method = Method::from_bytes(self.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidMethod(self.method.clone()))?;

        Ok(SchedulerConfig {
            endpoint,
            method,
            max_concurrency: self.max_concurrency,
            upload_rate_refresh_interval: Duration::from_millis(
                self.upload_rate_refresh_interval_ms,
            ),
            extended_mode_timeout: Duration::from_millis(self.extended_mode_timeout_ms),
            direct_upload: self.direct_upload,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            history_limit: self.history_limit,
        })
    }
}

/// Validated settings consumed by the scheduler and the transports.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub endpoint: Url,
    pub method: Method,
    pub max_concurrency: usize,
    pub upload_rate_refresh_interval: Duration,
    pub extended_mode_timeout: Duration,
    pub direct_upload: bool,
    pub request_timeout: Duration,
    pub history_limit: usize,
}

impl TryFrom<&UploadSettings> for SchedulerConfig {
    type Error = ConfigError;

    fn try_from(value: &UploadSettings) -> Result<Self, Self::Error> {
        value.validate()
    }
}
