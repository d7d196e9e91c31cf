//! Configuration module
//!
//! Builds the runner configuration from the environment and CLI overrides.

use anyhow::Result;
use tracing::debug;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine settings shared with the runner
    pub runner: lathe_runner::Config,
}

impl Config {
    /// Loads `LATHE_*` settings and applies command-line overrides
    pub fn load(container_binary: Option<String>, workspace: Option<String>) -> Result<Self> {
        let mut runner = lathe_runner::Config::from_env();

        if let Some(binary) = container_binary {
            runner = runner.with_container_binary(binary);
        }
        if let Some(workspace) = workspace {
            runner = runner.with_workspace_dir(workspace);
        }

        runner.validate()?;
        debug!(
            "Loaded configuration: container_binary={}, workspace={}",
            runner.container_binary,
            runner.workspace_dir.display()
        );

        Ok(Self { runner })
    }
}
