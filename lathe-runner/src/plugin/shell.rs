//! Shell plugin
//!
//! Serves `sh` and `echo` steps. `sh` runs its text through `sh -c`, inside
//! the stage container when the step carries a container id and on the host
//! workspace otherwise.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lathe_core::domain::log::LogEntry;
use lathe_core::domain::pipeline::StepParams;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::debug;

use super::{
    CONTAINER_ID, Plugin, PluginContext, TEXT, WORKFLOW_EXECUTION_ID, forward_output, required,
};
use crate::process::{spawn_streaming, strip_control_chars};

#[derive(Default)]
pub struct ShellPlugin {
    ctx: Option<PluginContext>,
}

impl ShellPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> Result<&PluginContext> {
        self.ctx.as_ref().context("shell plugin has not been started")
    }

    async fn sh(&self, params: &StepParams) -> Result<Option<String>> {
        let ctx = self.ctx()?;
        let script = required(params, TEXT)?;
        let workflow_id = params.get(WORKFLOW_EXECUTION_ID);

        let output = match params.get(CONTAINER_ID) {
            Some(container_id) => {
                debug!("Running sh in container {}: {}", container_id, script);
                let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
                ctx.containers.exec(container_id, &argv).await?
            }
            None => {
                debug!("Running sh on host: {}", script);
                tokio::fs::create_dir_all(&ctx.workspace_dir)
                    .await
                    .context("Failed to create workspace directory")?;

                let mut command = Command::new("sh");
                command.arg("-c").arg(script).current_dir(&ctx.workspace_dir);
                spawn_streaming(command, "sh")?
            }
        };

        let collected = forward_output(output, ctx.logs.as_ref(), workflow_id).await?;
        Ok(Some(collected))
    }

    fn echo(&self, params: &StepParams) -> Result<Option<String>> {
        let ctx = self.ctx()?;
        let text = strip_control_chars(required(params, TEXT)?);

        if let Some(workflow_id) = params.get(WORKFLOW_EXECUTION_ID) {
            ctx.logs.add_entry(workflow_id, LogEntry::info(text.clone()));
        }

        Ok(Some(text))
    }
}

#[async_trait]
impl Plugin for ShellPlugin {
    async fn start(&mut self, ctx: &PluginContext) -> Result<()> {
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn list_methods(&self) -> HashMap<String, String> {
        HashMap::from([
            ("echo".to_string(), "echo".to_string()),
            ("sh".to_string(), "sh".to_string()),
        ])
    }

    async fn invoke(&self, method: &str, params: &StepParams) -> Result<Option<String>> {
        match method {
            "sh" => self.sh(params).await,
            "echo" => self.echo(params),
            other => anyhow::bail!("shell plugin has no method '{}'", other),
        }
    }
}
