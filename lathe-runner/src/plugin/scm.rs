//! Source checkout plugin
//!
//! Serves `git` steps: clones a branch into the workspace, or pulls it when a
//! checkout of the same repository is already there.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lathe_core::domain::log::LogEntry;
use lathe_core::domain::pipeline::StepParams;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Plugin, PluginContext, WORKFLOW_EXECUTION_ID, forward_output, required};
use crate::process::spawn_streaming;

#[derive(Default)]
pub struct ScmPlugin {
    ctx: Option<PluginContext>,
}

impl ScmPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn checkout(&self, params: &StepParams) -> Result<Option<String>> {
        let ctx = self
            .ctx
            .as_ref()
            .context("scm plugin has not been started")?;

        let url = required(params, "url")?;
        let branch = required(params, "branch")?;
        let workflow_id = params.get(WORKFLOW_EXECUTION_ID);

        if let Some(credentials_id) = params.get("credentialsId") {
            debug!(
                "Checkout of {} requests credentials '{}', using ambient git credentials",
                url, credentials_id
            );
        }

        let dir = repo_dir_name(url)?;
        let target = ctx.workspace_dir.join(dir);

        tokio::fs::create_dir_all(&ctx.workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        if let Some(workflow_id) = workflow_id {
            ctx.logs.add_entry(
                workflow_id,
                LogEntry::info(format!("Checking out {} ({})", url, branch)),
            );
        }

        if target.join(".git").exists() {
            info!("Updating existing checkout {}", target.display());
            self.git(ctx, &target, &["checkout", branch], workflow_id).await?;
            self.git(ctx, &target, &["pull", "origin", branch], workflow_id).await?;
        } else {
            info!("Cloning {} into {}", url, target.display());
            let target_arg = target.to_string_lossy();
            self.git(
                ctx,
                &ctx.workspace_dir,
                &["clone", "--branch", branch, url, &*target_arg],
                workflow_id,
            )
            .await?;
        }

        Ok(Some(format!("Cloned repo {} and branch {}", url, branch)))
    }

    async fn git(
        &self,
        ctx: &PluginContext,
        cwd: &Path,
        args: &[&str],
        workflow_id: Option<&str>,
    ) -> Result<String> {
        let mut command = Command::new("git");
        command.args(args).current_dir(cwd);

        let output = spawn_streaming(command, &format!("git {}", args[0]))?;
        forward_output(output, ctx.logs.as_ref(), workflow_id).await
    }
}

/// Directory a repository URL is checked out into
///
/// The last path segment of the URL without its `.git` suffix.
pub fn repo_dir_name(url: &str) -> Result<&str> {
    let trimmed = url.trim_end_matches('/');
    let segment = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = segment.strip_suffix(".git").unwrap_or(segment);

    if name.is_empty() || name == "." || name == ".." {
        anyhow::bail!("cannot derive a checkout directory from url '{}'", url);
    }
    Ok(name)
}

#[async_trait]
impl Plugin for ScmPlugin {
    async fn start(&mut self, ctx: &PluginContext) -> Result<()> {
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn list_methods(&self) -> HashMap<String, String> {
        HashMap::from([("git".to_string(), "checkout".to_string())])
    }

    async fn invoke(&self, method: &str, params: &StepParams) -> Result<Option<String>> {
        match method {
            "checkout" => self.checkout(params).await,
            other => anyhow::bail!("scm plugin has no method '{}'", other),
        }
    }
}
