//! Docker-compatible CLI runtime
//!
//! Drives `docker` or `podman` through child processes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::ContainerRuntime;
use crate::process::{OutputStream, spawn_streaming};

/// Container runtime backed by a docker-compatible CLI
#[derive(Debug, Clone)]
pub struct CliContainerRuntime {
    binary: String,
}

impl CliContainerRuntime {
    /// Creates a runtime for the given CLI binary (e.g. `docker`, `podman`)
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Checks that the CLI is installed and answers
    pub async fn check_available(&self) -> Result<String> {
        let version = self
            .run(&["--version"])
            .await
            .with_context(|| {
                format!("Failed to execute '{} --version'. Is it installed?", self.binary)
            })?;

        info!("{} is available: {}", self.binary, version);
        Ok(version)
    }

    /// Runs a CLI command to completion and returns its trimmed stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {} {}", self.binary, args.join(" ")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stdout.trim().is_empty() {
            debug!("{} {} stdout: {}", self.binary, args[0], stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("{} {} stderr: {}", self.binary, args[0], stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let error_msg = format!(
                "{} {} failed: exit_code={}, stderr='{}'",
                self.binary,
                args.join(" "),
                exit_code,
                stderr.trim()
            );
            error!("{}", error_msg);
            anyhow::bail!("{}", error_msg);
        }

        Ok(stdout.trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for CliContainerRuntime {
    async fn pull(&self, image: &str) -> Result<()> {
        self.run(&["pull", "--quiet", image]).await?;
        Ok(())
    }

    async fn create_and_start(&self, image: &str) -> Result<String> {
        // A TTY keeps the shell entrypoint alive until the container is stopped
        let container_id = self
            .run(&["create", "-it", "--entrypoint", "sh", image])
            .await?;

        if container_id.is_empty() {
            anyhow::bail!("{} create returned no container id", self.binary);
        }

        if let Err(e) = self.run(&["start", &container_id]).await {
            if let Err(rm) = self.run(&["rm", "-f", &container_id]).await {
                warn!("Failed to remove unstarted container {}: {:#}", container_id, rm);
            }
            return Err(e);
        }

        Ok(container_id)
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<OutputStream> {
        debug!("Executing in container {}: {:?}", container_id, argv);

        let mut command = Command::new(&self.binary);
        command.arg("exec").arg(container_id).args(argv);

        spawn_streaming(command, &format!("{} exec", self.binary))
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let stopped = self.run(&["stop", container_id]).await;
        let removed = self.run(&["rm", "-f", container_id]).await;

        stopped.and(removed).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let runtime = CliContainerRuntime::new("lathe-no-such-container-cli");
        let err = runtime.check_available().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Is it installed?"));
    }

    #[tokio::test]
    async fn test_failed_command_reports_exit_code() {
        // `false` ignores its arguments and exits 1
        let runtime = CliContainerRuntime::new("false");
        let err = runtime.pull("alpine:latest").await.unwrap_err();
        assert!(err.to_string().contains("exit_code=1"));
    }

    /// Writes a fake CLI that records its arguments and fails `start`
    #[cfg(unix)]
    fn scripted_cli() -> (std::path::PathBuf, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("lathe-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log = dir.join("calls.log");
        let script = dir.join("fake-docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$*\" >> {log}\ncase \"$1\" in\n  create) echo ctr-42 ;;\n  start) echo 'cannot start' >&2; exit 1 ;;\nesac\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_removes_created_container() {
        let (script, log) = scripted_cli();
        let runtime = CliContainerRuntime::new(script.display().to_string());

        let err = runtime.create_and_start("alpine:latest").await.unwrap_err();
        assert!(err.to_string().contains("cannot start"));

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<_> = calls.lines().collect();
        assert_eq!(
            calls,
            vec![
                "create -it --entrypoint sh alpine:latest",
                "start ctr-42",
                "rm -f ctr-42",
            ]
        );
    }
}
