//! Step activity
//!
//! Resolves a step's command and invokes it under the retry policy: each
//! attempt is bounded by a timeout, failed attempts are retried with
//! exponential backoff, and no new attempt starts once the branch is
//! cancelled.

use lathe_core::domain::pipeline::StepParams;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

use super::cancel::CancelToken;
use crate::error::StepError;
use crate::plugin::PluginRegistry;

/// Timeout and retry parameters applied to every step
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let nanos =
            self.initial_interval.as_nanos() as f64 * self.backoff_coefficient.powi(exponent);
        let cap = self.max_interval.as_nanos() as f64;
        Duration::from_nanos(nanos.min(cap).round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(300),
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

/// Runs steps against the plugin registry
pub struct StepActivity {
    registry: Arc<PluginRegistry>,
    policy: RetryPolicy,
}

impl StepActivity {
    pub fn new(registry: Arc<PluginRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    /// Executes one step to completion or exhaustion
    ///
    /// # Arguments
    /// * `command` - The step's command keyword
    /// * `params` - Normalized step parameters
    /// * `cancel` - Branch cancellation token
    /// * `interrupt` - Abandon an in-flight attempt when `cancel` fires
    ///
    /// # Returns
    /// The plugin's output, if it produced any
    pub async fn run(
        &self,
        command: &str,
        params: &StepParams,
        cancel: &CancelToken,
        interrupt: bool,
    ) -> Result<Option<String>, StepError> {
        let binding = self
            .registry
            .resolve(command)
            .await
            .ok_or_else(|| StepError::Unresolved {
                command: command.to_string(),
            })?;

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            attempt += 1;

            debug!(
                "Running step '{}' via {}.{} (attempt {}/{})",
                command, binding.plugin, binding.method, attempt, self.policy.max_attempts
            );

            let call = time::timeout(
                self.policy.attempt_timeout,
                self.registry
                    .invoke(&binding.plugin, &binding.method, params),
            );

            let outcome = if interrupt {
                tokio::select! {
                    outcome = call => outcome,
                    _ = cancel.cancelled() => return Err(StepError::Cancelled),
                }
            } else {
                call.await
            };

            let error = match outcome {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) if !e.is_retryable() => StepError::Rejected {
                    command: command.to_string(),
                    message: e.to_string(),
                },
                Ok(Err(e)) => StepError::Failed {
                    command: command.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                },
                Err(_) => StepError::TimedOut {
                    command: command.to_string(),
                    attempts: attempt,
                    timeout: self.policy.attempt_timeout,
                },
            };

            if !error.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(error);
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                "Step '{}' failed (attempt {}): {}, retrying in {:?}",
                command, attempt, error, delay
            );

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }
    }
}
