//! Runner configuration
//!
//! Defines the parameters of the execution engine: step retry and timeout
//! policy, the container CLI to drive, the host workspace and how many
//! workflows may run at once.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::RetryPolicy;

/// Runner configuration
///
/// Timeouts and retry intervals are configurable so slow build hosts can
/// be given more room than a developer machine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum time a single step attempt may run
    pub step_timeout: Duration,

    /// Attempts per step before the stage fails
    pub max_attempts: u32,

    /// Delay before the first retry
    pub retry_initial_interval: Duration,

    /// Multiplier applied to the delay after each retry
    pub retry_backoff_coefficient: f64,

    /// Upper bound for the delay between attempts
    pub retry_max_interval: Duration,

    /// Docker-compatible CLI used for containerized stages (docker, podman)
    pub container_binary: String,

    /// Host directory checkouts and host shell steps run in
    pub workspace_dir: PathBuf,

    /// Max workflows executing concurrently
    pub max_parallel_workflows: usize,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            step_timeout: Duration::from_secs(300), // 5 minutes
            max_attempts: 3,
            retry_initial_interval: Duration::from_millis(1000),
            retry_backoff_coefficient: 2.0,
            retry_max_interval: Duration::from_secs(30),
            container_binary: "docker".to_string(),
            workspace_dir: PathBuf::from("./workspace"),
            max_parallel_workflows: 2,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional; unset or malformed values keep the default:
    /// - LATHE_STEP_TIMEOUT (seconds, default: 300)
    /// - LATHE_MAX_ATTEMPTS (default: 3)
    /// - LATHE_RETRY_INTERVAL_MS (milliseconds, default: 1000)
    /// - LATHE_CONTAINER_BINARY (default: docker)
    /// - LATHE_WORKSPACE (default: ./workspace)
    /// - LATHE_MAX_PARALLEL_WORKFLOWS (default: 2)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_parse::<u64>("LATHE_STEP_TIMEOUT") {
            config.step_timeout = Duration::from_secs(timeout);
        }

        if let Some(attempts) = env_parse::<u32>("LATHE_MAX_ATTEMPTS") {
            config.max_attempts = attempts;
        }

        if let Some(interval) = env_parse::<u64>("LATHE_RETRY_INTERVAL_MS") {
            config.retry_initial_interval = Duration::from_millis(interval);
        }

        if let Ok(binary) = std::env::var("LATHE_CONTAINER_BINARY") {
            config.container_binary = binary;
        }

        if let Ok(workspace) = std::env::var("LATHE_WORKSPACE") {
            config.workspace_dir = PathBuf::from(workspace);
        }

        if let Some(parallel) = env_parse::<usize>("LATHE_MAX_PARALLEL_WORKFLOWS") {
            config.max_parallel_workflows = parallel;
        }

        config
    }

    /// Sets the container CLI binary
    pub fn with_container_binary(mut self, binary: impl Into<String>) -> Self {
        self.container_binary = binary.into();
        self
    }

    /// Sets the host workspace directory
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    /// Retry policy applied to every step
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: self.step_timeout,
            initial_interval: self.retry_initial_interval,
            backoff_coefficient: self.retry_backoff_coefficient,
            max_interval: self.retry_max_interval,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.step_timeout.is_zero() {
            anyhow::bail!("step_timeout must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.retry_backoff_coefficient < 1.0 {
            anyhow::bail!("retry_backoff_coefficient must be at least 1.0");
        }

        if self.container_binary.trim().is_empty() {
            anyhow::bail!("container_binary cannot be empty");
        }

        if self.max_parallel_workflows == 0 {
            anyhow::bail!("max_parallel_workflows must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
