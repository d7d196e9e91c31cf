//! Child process streaming
//!
//! Runs a command with piped stdout/stderr and exposes its output as a
//! stream of lines. A non-zero exit status is yielded as the final item.
//! Dropping the stream kills the child.

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Lines produced by a running command
pub type OutputStream = BoxStream<'static, Result<String>>;

/// Spawns `command` and streams its output line by line
///
/// # Arguments
/// * `command` - The command to run, with arguments and working directory set
/// * `label` - Name used in error messages (e.g. `sh`, `docker exec`)
pub fn spawn_streaming(mut command: Command, label: &str) -> Result<OutputStream> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", label))?;

    let (tx, rx) = mpsc::channel::<Result<String>>(64);

    let stdout = child
        .stdout
        .take()
        .context("child stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("child stderr was not captured")?;

    let readers = [
        tokio::spawn(forward_lines(stdout, tx.clone())),
        tokio::spawn(forward_lines(stderr, tx.clone())),
    ];

    let label = label.to_string();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = tx.closed() => {
                debug!("Output of {} dropped, killing process", label);
                let _ = child.kill().await;
                return;
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                let code = status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let _ = tx
                    .send(Err(anyhow::anyhow!("{} exited with status {}", label, code)))
                    .await;
            }
            Err(e) => {
                let _ = tx
                    .send(Err(
                        anyhow::Error::new(e).context(format!("Failed to wait for {}", label)),
                    ))
                    .await;
            }
        }
    });

    Ok(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed())
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<Result<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Ok(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }
}

/// Removes terminal control characters from a line of output
pub fn strip_control_chars(line: &str) -> String {
    line.chars().filter(|c| !c.is_control()).collect()
}
