//! Scheduler configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `thread_name_prefix` | `"completes-scheduler"` |
//! | `min_dispatch_threads` | 1 |
//! | `idle_timeout` | 10 s |
//!
//! # Environment Variables
//!
//! Only variables that are set are applied, on top of whatever the config
//! already holds:
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COMPLETES_SCHEDULER_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `COMPLETES_SCHEDULER_MIN_THREADS` | `usize` | `min_dispatch_threads` |
//! | `COMPLETES_SCHEDULER_IDLE_TIMEOUT_MS` | `u64` | `idle_timeout` |

use std::time::Duration;

/// Environment variable name for the thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "COMPLETES_SCHEDULER_THREAD_NAME_PREFIX";
/// Environment variable name for the minimum number of dispatch threads.
pub const ENV_MIN_THREADS: &str = "COMPLETES_SCHEDULER_MIN_THREADS";
/// Environment variable name for the dispatch idle timeout in milliseconds.
pub const ENV_IDLE_TIMEOUT_MS: &str = "COMPLETES_SCHEDULER_IDLE_TIMEOUT_MS";

const DEFAULT_THREAD_NAME_PREFIX: &str = "completes-scheduler";
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error returned when configuration cannot be read from the environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set to a value that does not parse.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
        /// Human readable description of the accepted values.
        expected: &'static str,
    },
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Name prefix for the driver and dispatch threads.
    pub thread_name_prefix: String,
    /// Dispatch threads kept alive while idle. More are started whenever
    /// every worker is busy, so callbacks never queue behind each other.
    pub min_dispatch_threads: usize,
    /// How long a dispatch thread above the minimum may idle before retiring.
    pub idle_timeout: Duration,
}

impl SchedulerConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
    }

    /// Builds a config from defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.normalize();
        Ok(config)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            min_dispatch_threads: 1,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Apply environment variable overrides to a [`SchedulerConfig`].
///
/// Returns an error if a variable is set but contains an unparseable value;
/// in that case `config` may be partially updated.
pub fn apply_env_overrides(config: &mut SchedulerConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_MIN_THREADS) {
        config.min_dispatch_threads = parse_usize(ENV_MIN_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_IDLE_TIMEOUT_MS) {
        config.idle_timeout = Duration::from_millis(parse_u64(ENV_IDLE_TIMEOUT_MS, &val)?);
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: val.to_string(),
            expected: "unsigned integer",
        })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: val.to_string(),
            expected: "milliseconds as u64",
        })
}
