//! Session tuning knobs, loadable from YAML.
//!
//! Every field has a default so an empty document (or no config file at all)
//! yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 2_000;
const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COMMAND_BUFFER: usize = 32;

/// Per-session tunables shared by every session a registry creates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Resolution attempts per track before the track is abandoned.
    pub max_retries: u32,
    /// Constant delay between resolution attempts (not exponential).
    pub retry_backoff_ms: u64,
    /// How long an idle session with an empty queue keeps its voice
    /// connection before auto-disconnecting.
    pub inactivity_timeout_secs: u64,
    /// Depth of the per-session command inbox.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

impl SessionConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    /// Parse a YAML document; missing keys take their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }
}
