//! Container lifecycle
//!
//! Containerized stages run their steps inside a container that lives exactly
//! as long as the stage:
//! - Pulling the tag-normalized image
//! - Creating the container with a TTY and a shell entrypoint, then starting it
//! - Executing step commands inside it
//! - Stopping and removing it once the stage's steps are done

mod cli;

pub use cli::CliContainerRuntime;

use anyhow::Result;
use async_trait::async_trait;
use lathe_core::domain::pipeline::normalize_image_tag;
use std::sync::Arc;
use tracing::{info, warn};

use crate::process::OutputStream;

/// Minimal container runtime contract
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls an image reference
    async fn pull(&self, image: &str) -> Result<()>;

    /// Creates and starts a container, returning its id
    async fn create_and_start(&self, image: &str) -> Result<String>;

    /// Runs a command inside a running container
    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<OutputStream>;

    /// Stops and removes a container
    async fn stop(&self, container_id: &str) -> Result<()>;
}

/// Acquires and releases stage containers
#[derive(Clone)]
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Pulls the image and starts a container from it
    ///
    /// # Arguments
    /// * `image` - Image reference; `:latest` is appended when it has no tag
    ///
    /// # Returns
    /// A lease on the running container; it is stopped when the lease is
    /// released or dropped
    pub async fn acquire(&self, image: &str) -> Result<ContainerLease> {
        let image = normalize_image_tag(image);

        info!("Pulling image {}", image);
        self.runtime.pull(&image).await?;

        let container_id = self.runtime.create_and_start(&image).await?;
        info!("Container {} started from {}", container_id, image);

        Ok(ContainerLease {
            manager: self.clone(),
            id: Some(container_id),
        })
    }

    /// Stops and removes a container
    ///
    /// Failures are logged and otherwise ignored; the container may leak.
    pub async fn release(&self, container_id: &str) {
        match self.runtime.stop(container_id).await {
            Ok(()) => info!("Container {} stopped and removed", container_id),
            Err(e) => warn!("Failed to stop container {}: {:#}", container_id, e),
        }
    }
}

/// A running stage container
///
/// Dropping an unreleased lease (unwinding or a cancelled task) schedules the
/// stop on the current runtime.
pub struct ContainerLease {
    manager: ContainerManager,
    id: Option<String>,
}

impl ContainerLease {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Stops and removes the container
    pub async fn release(mut self) {
        if let Some(id) = self.id.take() {
            self.manager.release(&id).await;
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Container {} dropped without release, stopping it", id);
                let manager = self.manager.clone();
                handle.spawn(async move { manager.release(&id).await });
            }
            Err(_) => warn!("Container {} leaked: no runtime left to stop it", id),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording runtime used by engine and plugin tests

    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Pull(String),
        Start(String),
        Exec(String, Vec<String>),
        Stop(String),
    }

    #[derive(Default)]
    pub struct FakeRuntime {
        pub calls: Mutex<Vec<Call>>,
        pub fail_pull: bool,
        pub fail_stop: bool,
        pub next_id: Mutex<u32>,
    }

    impl FakeRuntime {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull(&self, image: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Pull(image.to_string()));
            if self.fail_pull {
                anyhow::bail!("manifest for {} not found", image);
            }
            Ok(())
        }

        async fn create_and_start(&self, image: &str) -> Result<String> {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let id = format!("ctr-{}", next_id);
            self.calls
                .lock()
                .unwrap()
                .push(Call::Start(format!("{}={}", id, image)));
            Ok(id)
        }

        async fn exec(&self, container_id: &str, argv: &[String]) -> Result<OutputStream> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Exec(container_id.to_string(), argv.to_vec()));
            let line = format!("[{}] {}", container_id, argv.join(" "));
            Ok(futures::stream::iter(vec![Ok(line)]).boxed())
        }

        async fn stop(&self, container_id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Stop(container_id.to_string()));
            if self.fail_stop {
                anyhow::bail!("container {} is not running", container_id);
            }
            Ok(())
        }
    }
}
