//! Plugin commands
//!
//! Sets up the built-in plugins and lists the commands they provide.

use anyhow::Result;
use colored::*;
use lathe_runner::{
    ContainerRuntime, InMemoryLogBuffer, LogBufferService, PluginContext, PluginRegistry,
    register_builtins,
};
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;

/// Creates a registry with the built-in plugins started
pub async fn builtin_registry(
    config: &Config,
    logs: Arc<dyn LogBufferService>,
    containers: Arc<dyn ContainerRuntime>,
) -> Result<Arc<PluginRegistry>> {
    let registry = Arc::new(PluginRegistry::new(PluginContext {
        logs,
        containers,
        workspace_dir: config.runner.workspace_dir.clone(),
    }));

    register_builtins(&registry).await?;
    Ok(registry)
}

/// Stops every plugin, reporting failures without aborting
pub async fn shutdown(registry: &PluginRegistry) {
    for err in registry.unregister_all().await {
        warn!("Plugin shutdown: {}", err);
    }
}

/// List advertised commands
pub async fn list(config: &Config) -> Result<()> {
    let containers = Arc::new(lathe_runner::CliContainerRuntime::new(
        config.runner.container_binary.clone(),
    ));
    let registry =
        builtin_registry(config, Arc::new(InMemoryLogBuffer::new()), containers).await?;

    let commands = registry.commands().await;
    println!("{}", format!("Found {} command(s):", commands.len()).bold());
    println!();
    for binding in &commands {
        println!(
            "  {} {} {}",
            "▸".cyan(),
            binding.command.bold(),
            format!("→ {}.{}", binding.plugin, binding.method).dimmed()
        );
    }

    shutdown(&registry).await;
    Ok(())
}
