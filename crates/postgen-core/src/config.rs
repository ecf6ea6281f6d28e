use serde::{Deserialize, Serialize};

use crate::error::{PostgenError, Result};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const ENV_API_URL: &str = "POSTGEN_API_URL";
pub const ENV_CONNECT_TIMEOUT: &str = "POSTGEN_CONNECT_TIMEOUT_SECS";

/// Where the generation service lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Service root, without a trailing slash.
    pub base_url: String,

    /// Applies to establishing the connection only. Reads are never timed out.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `POSTGEN_API_URL` and `POSTGEN_CONNECT_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            config = config.with_base_url(url);
        }

        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                PostgenError::Config(format!("{ENV_CONNECT_TIMEOUT} must be a whole number of seconds, got '{raw}'"))
            })?;
            config = config.with_connect_timeout_secs(secs);
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.base_url = url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}
