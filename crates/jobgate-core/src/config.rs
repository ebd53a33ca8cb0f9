//! RuntimeConfig - 実行時設定
//!
//! JSON で上書きできる項目だけを持ちます。欠けた項目は既定値になります。
//!
//! ```json
//! { "workers": 8, "artifact_ttl_secs": 3600 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest artifact TTL accepted (ten years).
pub const MAX_ARTIFACT_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool size.
    pub workers: usize,

    /// Bounded queue size. Submits beyond it fail with `QueueSaturated`.
    pub queue_capacity: usize,

    /// Added to `created_at` to get `expires_at`.
    pub artifact_ttl_secs: u64,

    pub heartbeat_interval_ms: u64,

    /// A Processing task silent for longer than this is reaped.
    pub heartbeat_timeout_ms: u64,

    pub reaper_interval_ms: u64,

    pub sweep_interval_ms: u64,

    /// Claims allowed before an orphaned task is failed instead of requeued.
    pub max_claims: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            artifact_ttl_secs: 24 * 60 * 60,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 10_000,
            reaper_interval_ms: 2_000,
            sweep_interval_ms: 60_000,
            max_claims: 3,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_claims == 0 {
            return Err(ConfigError::Invalid("max_claims must be at least 1".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.reaper_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        if self.artifact_ttl_secs > MAX_ARTIFACT_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "artifact_ttl_secs ({}) must not exceed {MAX_ARTIFACT_TTL_SECS}",
                self.artifact_ttl_secs
            )));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    /// Saturates at `chrono::Duration::MAX` for values `validate` would reject.
    pub fn artifact_ttl(&self) -> chrono::Duration {
        i64::try_from(self.artifact_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        i64::try_from(self.heartbeat_timeout_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
