//! Client configuration.
//!
//! Defaults match a locally running API. `from_env` lets the base URL and the
//! timeouts be overridden without code changes.

use std::time::Duration;

use thiserror::Error;

use crate::gateway::DEFAULT_REFRESH_TIMEOUT;

pub const DEFAULT_BASE_URL: &str = "http://localhost:4000";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_BASE_URL: &str = "TODO_API_URL";
const ENV_REFRESH_TIMEOUT: &str = "TODO_REFRESH_TIMEOUT_SECS";
const ENV_REQUEST_TIMEOUT: &str = "TODO_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a whole number of seconds, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    /// Deadline for the refresh-token call. `None` disables it.
    pub refresh_timeout: Option<Duration>,
    /// Deadline applied by the HTTP transport to every request.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_timeout: Some(DEFAULT_REFRESH_TIMEOUT),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// A timeout of `0` seconds disables that deadline.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_BASE_URL).filter(|url| !url.trim().is_empty()) {
            config.base_url = url;
        }
        if let Some(value) = lookup(ENV_REFRESH_TIMEOUT) {
            config.refresh_timeout = parse_timeout(ENV_REFRESH_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT) {
            config.request_timeout = parse_timeout(ENV_REQUEST_TIMEOUT, &value)?;
        }
        Ok(config)
    }
}

fn parse_timeout(var: &'static str, value: &str) -> Result<Option<Duration>, ConfigError> {
    let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: value.to_string(),
    })?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
