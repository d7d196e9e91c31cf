//! Command plugins
//!
//! A plugin advertises the step command keywords it handles and executes them.
//! Steps reach plugins through the [`PluginRegistry`], which maps each keyword
//! to the plugin and method serving it.

pub(crate) mod registry;
mod scm;
mod shell;

pub use registry::{CommandBinding, PluginRegistry};
pub use scm::ScmPlugin;
pub use shell::ShellPlugin;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use lathe_core::domain::log::LogEntry;
use lathe_core::domain::pipeline::StepParams;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::container::ContainerRuntime;
use crate::error::RegistryError;
use crate::log_buffer::LogBufferService;
use crate::process::{OutputStream, strip_control_chars};

/// Parameter carrying the workflow execution id, injected into every step
pub const WORKFLOW_EXECUTION_ID: &str = "workflowExecutionId";

/// Parameter carrying the stage container id, injected for containerized stages
pub const CONTAINER_ID: &str = "containerId";

/// Parameter a single-value step's value is passed under
pub const TEXT: &str = "text";

/// Services handed to plugins when they start
#[derive(Clone)]
pub struct PluginContext {
    pub logs: Arc<dyn LogBufferService>,
    pub containers: Arc<dyn ContainerRuntime>,
    pub workspace_dir: PathBuf,
}

/// A step command handler
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Acquires whatever the plugin needs before it can serve calls
    async fn start(&mut self, ctx: &PluginContext) -> Result<()>;

    /// Releases the plugin's resources
    async fn stop(&self) -> Result<()>;

    /// Command keyword to method name
    fn list_methods(&self) -> HashMap<String, String>;

    /// Executes one of the advertised methods
    ///
    /// `Ok(None)` means the method completed without output.
    async fn invoke(&self, method: &str, params: &StepParams) -> Result<Option<String>>;
}

/// Registers the shell and scm plugins
pub async fn register_builtins(registry: &PluginRegistry) -> Result<(), RegistryError> {
    registry.register("shell", Box::new(ShellPlugin::new())).await?;
    registry.register("scm", Box::new(ScmPlugin::new())).await?;
    Ok(())
}

/// Looks up a parameter a method cannot run without
pub fn required<'a>(params: &'a StepParams, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("missing required parameter '{}'", key))
}

/// Copies streamed output into the workflow's log buffer and collects it
///
/// Control characters are stripped from every line. The first error in the
/// stream ends collection and is returned.
pub async fn forward_output(
    mut output: OutputStream,
    logs: &dyn LogBufferService,
    workflow_id: Option<&str>,
) -> Result<String> {
    let mut lines = Vec::new();

    while let Some(item) = output.next().await {
        let line = strip_control_chars(&item?);
        if let Some(workflow_id) = workflow_id {
            logs.add_entry(workflow_id, LogEntry::info(line.clone()));
        }
        lines.push(line);
    }

    Ok(lines.join("\n"))
}
