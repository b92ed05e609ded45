use crate::core::errors::{CoordError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Coordinator configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    // Worker pool
    /// Number of logical workers (concurrent block slots)
    pub max_workers: usize,
    /// How long a ready block waits for an idle worker before staying pending
    pub worker_wait_timeout_ms: u64,
    /// Entries kept in each worker's log buffer
    pub worker_log_capacity: usize,

    // Progress
    /// Interval between progress recomputations
    pub progress_update_interval_ms: u64,

    // Execution policy
    /// Run the verifier after every successful execution
    pub verify_before_merge: bool,
    /// Skip file locking entirely
    pub allow_concurrent_file_edits: bool,
    /// How long a block waits for each file lock
    pub lock_timeout_ms: u64,

    // Retry
    /// Send failed blocks back to pending
    pub retry_failed_blocks: bool,
    /// Retries per block before it is terminally failed
    pub max_retries: u32,

    // Notifications
    /// Buffered events per subscriber before the oldest is dropped
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            worker_wait_timeout_ms: 60_000,
            worker_log_capacity: 100,

            progress_update_interval_ms: 2_000,

            verify_before_merge: true,
            allow_concurrent_file_edits: false,
            lock_timeout_ms: 30_000,

            retry_failed_blocks: true,
            max_retries: 2,

            event_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_progress_interval_ms(mut self, interval_ms: u64) -> Self {
        self.progress_update_interval_ms = interval_ms;
        self
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_before_merge = enabled;
        self
    }

    pub fn with_concurrent_file_edits(mut self, allowed: bool) -> Self {
        self.allow_concurrent_file_edits = allowed;
        self
    }

    pub fn with_retries(mut self, enabled: bool, max_retries: u32) -> Self {
        self.retry_failed_blocks = enabled;
        self.max_retries = max_retries;
        self
    }

    pub fn with_worker_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.worker_wait_timeout_ms = timeout_ms;
        self
    }

    pub fn with_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn worker_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_wait_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_update_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CoordError::configuration_field(
                "max_workers must be greater than 0",
                "max_workers",
            ));
        }
        if self.progress_update_interval_ms == 0 {
            return Err(CoordError::configuration_field(
                "progress_update_interval_ms must be greater than 0",
                "progress_update_interval_ms",
            ));
        }
        if self.worker_log_capacity == 0 {
            return Err(CoordError::configuration_field(
                "worker_log_capacity must be greater than 0",
                "worker_log_capacity",
            ));
        }
        if self.event_capacity == 0 {
            return Err(CoordError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        Ok(())
    }

    /// Parse and validate a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoordError::io(format!("read config {}", path.display()), e))?;
        debug!("Loading coordinator config from {}", path.display());

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_wait_timeout(), Duration::from_secs(60));
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.progress_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = CoordinatorConfig::default()
            .with_max_workers(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::Configuration { field: Some(ref f), .. } if f == "max_workers"
        ));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = CoordinatorConfig::from_yaml_str(
            "max_workers: 5\nretry_failed_blocks: false\n",
        )
        .unwrap();
        assert_eq!(config.max_workers, 5);
        assert!(!config.retry_failed_blocks);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.lock_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_yaml_is_serialization_error() {
        let err = CoordinatorConfig::from_yaml_str("max_workers: [oops").unwrap_err();
        assert_eq!(err.category(), "serialization");
    }
}
