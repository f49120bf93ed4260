//! Engine settings from defaults, builders and `OVERLAY_*` environment variables

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{OverlayError, Result};

/// Environment variable overriding the worker count
pub const ENV_WORKERS: &str = "OVERLAY_WORKERS";
/// Environment variable overriding batches planned per worker
pub const ENV_BATCHES_PER_WORKER: &str = "OVERLAY_BATCHES_PER_WORKER";
/// Environment variable overriding attempts per batch
pub const ENV_MAX_BATCH_ATTEMPTS: &str = "OVERLAY_MAX_BATCH_ATTEMPTS";
/// Environment variable setting the per-batch timeout in milliseconds
pub const ENV_BATCH_TIMEOUT_MS: &str = "OVERLAY_BATCH_TIMEOUT_MS";

/// Overlay engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of workers in each job's pool
    pub worker_count: usize,
    /// Batches planned per worker when the request carries no batch-size hint
    pub batches_per_worker: usize,
    /// Attempts per batch before it is marked permanently failed (2 = one retry)
    pub max_batch_attempts: u32,
    /// Optional per-batch timeout in milliseconds
    pub batch_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            batches_per_worker: 4,
            max_batch_attempts: 2,
            batch_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `OVERLAY_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(workers) = read_env::<usize>(ENV_WORKERS)? {
            config.worker_count = workers;
        }
        if let Some(per_worker) = read_env::<usize>(ENV_BATCHES_PER_WORKER)? {
            config.batches_per_worker = per_worker;
        }
        if let Some(attempts) = read_env::<u32>(ENV_MAX_BATCH_ATTEMPTS)? {
            config.max_batch_attempts = attempts;
        }
        if let Some(timeout) = read_env::<u64>(ENV_BATCH_TIMEOUT_MS)? {
            config.batch_timeout_ms = Some(timeout);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the worker count
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    /// Set batches planned per worker
    pub fn with_batches_per_worker(mut self, batches: usize) -> Self {
        self.batches_per_worker = batches.max(1);
        self
    }

    /// Set attempts per batch
    pub fn with_max_batch_attempts(mut self, attempts: u32) -> Self {
        self.max_batch_attempts = attempts.max(1);
        self
    }

    /// Set the per-batch timeout
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Per-batch timeout, if configured
    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(OverlayError::Config("worker_count must be at least 1".to_string()));
        }
        if self.batches_per_worker == 0 {
            return Err(OverlayError::Config("batches_per_worker must be at least 1".to_string()));
        }
        if self.max_batch_attempts == 0 {
            return Err(OverlayError::Config("max_batch_attempts must be at least 1".to_string()));
        }
        if self.batch_timeout_ms == Some(0) {
            return Err(OverlayError::Config("batch_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| OverlayError::Config(format!("{key} has invalid value '{raw}'"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(OverlayError::Config(format!("{key}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.worker_count > 0);
        assert_eq!(config.max_batch_attempts, 2);
        assert!(config.batch_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_configuration() {
        let config = EngineConfig::default()
            .with_worker_count(3)
            .with_batches_per_worker(2)
            .with_max_batch_attempts(1)
            .with_batch_timeout(Duration::from_millis(250));

        assert_eq!(config.worker_count, 3);
        assert_eq!(config.batches_per_worker, 2);
        assert_eq!(config.max_batch_attempts, 1);
        assert_eq!(config.batch_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "worker_count": 2, "batch_timeout_ms": 500 }"#)
            .expect("config should parse");
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.batches_per_worker, 4);
        assert_eq!(config.batch_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = EngineConfig::from_json(r#"{ "worker_count": 0 }"#).unwrap_err();
        assert!(matches!(err, OverlayError::Config(_)));
    }
}
