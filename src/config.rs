//! Collector settings supplied at construction time.
//!
//! The core never reads the environment itself. The entry point builds a
//! [`CollectorSettings`] (from defaults, a JSON file, or by hand) and passes
//! it to [`crate::collector::Collector::new`].

use std::path::Path;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;
use crate::session::SecurityLevel;

pub const DEFAULT_MAX_WORKERS: usize = 2;
pub const DEFAULT_POOL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SSH_RETRY_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CANCEL_GRACE_SECS: f64 = 5.0;

/// Tunables for the worker pool, the retry controller and task defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CollectorSettings {
    /// Maximum concurrent SSH sessions per batch.
    pub max_workers: usize,
    /// Upper bound for a single task once dispatched by the pool.
    pub pool_timeout_secs: u64,
    /// Base delay of the linear retry backoff (`delay * attempt`).
    pub ssh_retry_delay_secs: f64,
    /// Retry budget for tasks that do not carry their own.
    pub default_retry_count: u32,
    /// Task timeout for tasks that do not carry their own.
    pub default_task_timeout_secs: u64,
    /// Whether batches may run in parallel at all.
    pub threading_enabled: bool,
    /// SSH algorithm policy for new connections.
    pub security_level: SecurityLevel,
    /// How long a cancelled task gets to disconnect before it is abandoned.
    pub cancel_grace_secs: f64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            pool_timeout_secs: DEFAULT_POOL_TIMEOUT_SECS,
            ssh_retry_delay_secs: DEFAULT_SSH_RETRY_DELAY_SECS,
            default_retry_count: DEFAULT_RETRY_COUNT,
            default_task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            threading_enabled: true,
            security_level: SecurityLevel::LegacyCompatible,
            cancel_grace_secs: DEFAULT_CANCEL_GRACE_SECS,
        }
    }
}

impl CollectorSettings {
    /// Parses settings from a JSON document. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, CollectorError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CollectorError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.max_workers == 0 {
            return Err(CollectorError::Settings(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.default_retry_count == 0 {
            return Err(CollectorError::Settings(
                "default_retry_count must be at least 1".to_string(),
            ));
        }
        if !self.ssh_retry_delay_secs.is_finite() || self.ssh_retry_delay_secs < 0.0 {
            return Err(CollectorError::Settings(format!(
                "ssh_retry_delay_secs must be a non-negative number, got {}",
                self.ssh_retry_delay_secs
            )));
        }
        if !self.cancel_grace_secs.is_finite() || self.cancel_grace_secs < 0.0 {
            return Err(CollectorError::Settings(format!(
                "cancel_grace_secs must be a non-negative number, got {}",
                self.cancel_grace_secs
            )));
        }
        Ok(())
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.ssh_retry_delay_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cancel_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = CollectorSettings::from_json(r#"{"max_workers": 8}"#).unwrap();
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.pool_timeout_secs, DEFAULT_POOL_TIMEOUT_SECS);
        assert_eq!(settings.default_retry_count, DEFAULT_RETRY_COUNT);
        assert!(settings.threading_enabled);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = CollectorSettings::from_json(r#"{"max_workers": 0}"#).unwrap_err();
        assert!(matches!(err, CollectorError::Settings(_)));
    }

    #[test]
    fn retry_delay_accepts_fractional_seconds() {
        let settings = CollectorSettings {
            ssh_retry_delay_secs: 0.25,
            ..Default::default()
        };
        assert_eq!(settings.retry_delay(), Duration::from_millis(250));
    }
}
