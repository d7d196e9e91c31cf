//! Lathe Runner
//!
//! Executes parsed pipelines as workflows.
//!
//! Architecture:
//! - Configuration: engine settings from the environment or defaults
//! - Plugins: command handlers behind a registry keyed by step command
//! - Containers: per-stage container lifecycle over a docker-compatible CLI
//! - Engine: stage walk, parallel branches, retry policy and workflow state
//! - Launcher: submission surface returning workflow ids and exposing state and logs

pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod log_buffer;
pub mod plugin;
pub mod process;

pub use config::Config;
pub use container::{CliContainerRuntime, ContainerLease, ContainerManager, ContainerRuntime};
pub use engine::{CancelToken, Engine, RetryPolicy, StateHandle, StepActivity};
pub use error::{ExecutionError, LaunchError, RegistryError, StepError};
pub use launcher::{WorkflowLauncher, WorkflowSummary};
pub use log_buffer::{InMemoryLogBuffer, LogBufferService};
pub use plugin::{
    CommandBinding, Plugin, PluginContext, PluginRegistry, ScmPlugin, ShellPlugin,
    register_builtins,
};
