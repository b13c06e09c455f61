//! Worker lifecycle configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_range, validate_required_string, Validatable};
use backdrop_ipc::{DEFAULT_CHANNEL_CAPACITY, MAX_CHANNEL_CAPACITY, MIN_CHANNEL_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest cooperative cancel window before a worker is killed
pub const MAX_CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Worker lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of workers that may be live at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Byte capacity of each channel direction when a launch does not name one
    #[serde(default = "default_channel_capacity")]
    pub default_channel_capacity: usize,

    /// Bound applied to `wait` calls that pass no timeout; unbounded when unset
    #[serde(
        with = "crate::domains::utils::serde_duration_ms_option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub default_wait_timeout: Option<Duration>,

    /// Time a worker gets to honour a cancel request before it is killed
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_cancel_grace_period"
    )]
    pub cancel_grace_period: Duration,

    /// How long a finished worker whose result was read stays listed
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_result_retention"
    )]
    pub result_retention: Duration,

    /// Worker executable; the running executable when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Arguments placed before `--worker-id <id>`
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_channel_capacity: default_channel_capacity(),
            default_wait_timeout: None,
            cancel_grace_period: default_cancel_grace_period(),
            result_retention: default_result_retention(),
            program: None,
            args: default_args(),
        }
    }
}

impl WorkerConfig {
    /// Cancel grace period clamped to the accepted window
    pub fn effective_grace_period(&self) -> Duration {
        self.cancel_grace_period.min(MAX_CANCEL_GRACE_PERIOD)
    }
}

impl Validatable for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_workers, "max_workers", self.domain_name())?;

        validate_range(
            self.default_channel_capacity,
            MIN_CHANNEL_CAPACITY,
            MAX_CHANNEL_CAPACITY,
            "default_channel_capacity",
            self.domain_name(),
        )?;

        if let Some(program) = &self.program {
            validate_required_string(
                &program.to_string_lossy(),
                "program",
                self.domain_name(),
            )?;
        }

        for arg in &self.args {
            validate_required_string(arg, "args entry", self.domain_name())?;
        }

        if self.cancel_grace_period > MAX_CANCEL_GRACE_PERIOD {
            tracing::warn!(
                "cancel_grace_period of {:?} exceeds {:?} and will be clamped",
                self.cancel_grace_period,
                MAX_CANCEL_GRACE_PERIOD
            );
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "workers"
    }
}

// Default value functions
fn default_max_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_cancel_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_result_retention() -> Duration {
    Duration::from_secs(60)
}

fn default_args() -> Vec<String> {
    vec!["worker".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::default();
        assert!(config.max_workers >= 1);
        assert_eq!(config.default_channel_capacity, 65536);
        assert_eq!(config.default_wait_timeout, None);
        assert_eq!(config.cancel_grace_period, Duration::from_secs(5));
        assert_eq!(config.args, vec!["worker".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_config_validation() {
        let mut config = WorkerConfig::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.default_channel_capacity = 512;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.args = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grace_period_is_clamped() {
        let mut config = WorkerConfig::default();
        config.cancel_grace_period = Duration::from_secs(600);
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_grace_period(), Duration::from_secs(60));
    }

    #[test]
    fn test_durations_are_milliseconds_in_yaml() {
        let config: WorkerConfig = serde_yaml::from_str(
            "max_workers: 2\ndefault_wait_timeout: 1500\ncancel_grace_period: 250\n",
        )
        .unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.default_wait_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.cancel_grace_period, Duration::from_millis(250));
        assert_eq!(config.result_retention, Duration::from_secs(60));
    }
}
