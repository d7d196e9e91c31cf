//! Error types of the execution engine

use std::time::Duration;

use lathe_dsl::ParseError;
use thiserror::Error;

/// Failures of the plugin registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("plugin '{plugin}' failed to start: {source:#}")]
    StartFailed {
        plugin: String,
        source: anyhow::Error,
    },

    /// Two plugins advertise the same command keyword
    #[error("command '{command}' of plugin '{plugin}' is already provided by '{existing}'")]
    CommandConflict {
        command: String,
        plugin: String,
        existing: String,
    },

    #[error("plugin '{0}' is not registered")]
    UnknownPlugin(String),

    #[error("plugin '{plugin}' has no method '{method}'")]
    UnknownMethod { plugin: String, method: String },

    #[error("{source:#}")]
    Invocation {
        plugin: String,
        method: String,
        source: anyhow::Error,
    },

    #[error("plugin '{plugin}' failed to stop: {source:#}")]
    StopFailed {
        plugin: String,
        source: anyhow::Error,
    },
}

impl RegistryError {
    /// Whether a later attempt of the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Invocation { .. })
    }
}

/// Why a step did not produce output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// No plugin handles the step's command
    #[error("no plugin registered for command '{command}'")]
    Unresolved { command: String },

    #[error("step '{command}' timed out after {attempts} attempt(s) of {timeout:?}")]
    TimedOut {
        command: String,
        attempts: u32,
        timeout: Duration,
    },

    #[error("{message}")]
    Failed {
        command: String,
        attempts: u32,
        message: String,
    },

    /// The registry refused the call; another attempt would fail the same way
    #[error("{message}")]
    Rejected { command: String, message: String },

    /// The stage container could not be pulled, created or started
    #[error("failed to start container for image '{image}': {message}")]
    Container { image: String, message: String },

    /// A sibling branch failed and this branch stopped before finishing
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether the failure is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::TimedOut { .. } | StepError::Failed { .. })
    }
}

/// Preconditions of an execution that were not met
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("missing required property '{0}'")]
    MissingProperty(String),
}

/// Failures surfaced to a workflow submitter
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// The report was already taken by an earlier `wait`
    #[error("workflow '{0}' has already been awaited")]
    AlreadyAwaited(String),

    #[error("workflow '{id}' aborted: {reason}")]
    Aborted { id: String, reason: String },
}
