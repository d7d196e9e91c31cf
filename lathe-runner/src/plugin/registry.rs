//! Plugin registry
//!
//! Owns the live plugins and the command keyword table built from what they
//! advertise. Invocations take a read lock only long enough to clone the
//! plugin handle, so concurrent steps never wait on each other; registration
//! and removal take the write lock.

use lathe_core::domain::pipeline::StepParams;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Plugin, PluginContext};
use crate::error::RegistryError;

/// Plugin and method a command keyword resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandBinding {
    pub command: String,
    pub plugin: String,
    pub method: String,
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    methods: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    plugins: HashMap<String, Entry>,
    commands: HashMap<String, CommandBinding>,
}

/// Registry of command plugins
pub struct PluginRegistry {
    ctx: PluginContext,
    inner: RwLock<Inner>,
}

impl PluginRegistry {
    /// Creates an empty registry whose plugins start with `ctx`
    pub fn new(ctx: PluginContext) -> Self {
        Self {
            ctx,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Starts a plugin and records the commands it advertises
    ///
    /// # Errors
    /// - `AlreadyRegistered` if a plugin with this name exists
    /// - `StartFailed` if the plugin's start hook fails
    /// - `CommandConflict` if one of its commands is already bound; the
    ///   plugin is stopped again
    pub async fn register(
        &self,
        name: &str,
        mut plugin: Box<dyn Plugin>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        if inner.plugins.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }

        plugin
            .start(&self.ctx)
            .await
            .map_err(|source| RegistryError::StartFailed {
                plugin: name.to_string(),
                source,
            })?;

        let methods = plugin.list_methods();

        let conflict = methods
            .keys()
            .find_map(|command| inner.commands.get(command));
        if let Some(existing) = conflict {
            let err = RegistryError::CommandConflict {
                command: existing.command.clone(),
                plugin: name.to_string(),
                existing: existing.plugin.clone(),
            };
            if let Err(e) = plugin.stop().await {
                warn!("Failed to stop rejected plugin {}: {:#}", name, e);
            }
            return Err(err);
        }

        for (command, method) in &methods {
            inner.commands.insert(
                command.clone(),
                CommandBinding {
                    command: command.clone(),
                    plugin: name.to_string(),
                    method: method.clone(),
                },
            );
        }

        info!("Registered plugin {} with {} command(s)", name, methods.len());

        inner.plugins.insert(
            name.to_string(),
            Entry {
                plugin: Arc::from(plugin),
                methods,
            },
        );

        Ok(())
    }

    /// Looks up the plugin method serving a command keyword
    pub async fn resolve(&self, command: &str) -> Option<CommandBinding> {
        self.inner.read().await.commands.get(command).cloned()
    }

    /// Invokes a method of a registered plugin
    ///
    /// # Errors
    /// - `UnknownPlugin` / `UnknownMethod` if nothing serves the call
    /// - `Invocation` if the plugin method itself fails
    pub async fn invoke(
        &self,
        plugin: &str,
        method: &str,
        params: &StepParams,
    ) -> Result<Option<String>, RegistryError> {
        let handle = {
            let inner = self.inner.read().await;
            let entry = inner
                .plugins
                .get(plugin)
                .ok_or_else(|| RegistryError::UnknownPlugin(plugin.to_string()))?;

            if !entry.methods.values().any(|m| m == method) {
                return Err(RegistryError::UnknownMethod {
                    plugin: plugin.to_string(),
                    method: method.to_string(),
                });
            }

            Arc::clone(&entry.plugin)
        };

        debug!("Invoking {}.{}", plugin, method);

        handle
            .invoke(method, params)
            .await
            .map_err(|source| RegistryError::Invocation {
                plugin: plugin.to_string(),
                method: method.to_string(),
                source,
            })
    }

    /// Stops a plugin and removes it with its commands
    pub async fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let entry = {
            let mut inner = self.inner.write().await;
            let entry = inner
                .plugins
                .remove(name)
                .ok_or_else(|| RegistryError::UnknownPlugin(name.to_string()))?;
            inner.commands.retain(|_, binding| binding.plugin != name);
            entry
        };

        entry
            .plugin
            .stop()
            .await
            .map_err(|source| RegistryError::StopFailed {
                plugin: name.to_string(),
                source,
            })?;

        info!("Unregistered plugin {}", name);
        Ok(())
    }

    /// Unregisters every plugin
    ///
    /// Stop failures do not interrupt the sweep; they are returned together.
    pub async fn unregister_all(&self) -> Vec<RegistryError> {
        let mut names: Vec<String> = self.inner.read().await.plugins.keys().cloned().collect();
        names.sort();

        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self.unregister(&name).await {
                warn!("{}", e);
                errors.push(e);
            }
        }
        errors
    }

    /// All command bindings, sorted by command keyword
    pub async fn commands(&self) -> Vec<CommandBinding> {
        let mut commands: Vec<_> = self.inner.read().await.commands.values().cloned().collect();
        commands.sort_by(|a, b| a.command.cmp(&b.command));
        commands
    }

    /// Names of the registered plugins, sorted
    pub async fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().await.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}
