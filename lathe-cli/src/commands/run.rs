//! Run command
//!
//! Runs a pipeline locally: submits it through the workflow launcher, tails
//! its output until the workflow is done and prints the per-stage results.

use anyhow::{Context, Result};
use colored::*;
use lathe_core::domain::log::{LogEntry, LogLevel};
use lathe_core::domain::pipeline::{Agent, Pipeline, Stage};
use lathe_core::domain::workflow::{ExecutionReport, StageResults};
use lathe_runner::{
    CliContainerRuntime, Engine, InMemoryLogBuffer, LogBufferService, WorkflowLauncher,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::pipeline;
use super::plugins::{builtin_registry, shutdown};
use crate::config::Config;

/// How often buffered output is printed while a workflow runs
const TAIL_INTERVAL: Duration = Duration::from_millis(200);

/// Parse a single key=value pair
pub fn parse_key_val(s: &str) -> Result<(String, String)> {
    let pos = s
        .find('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Run a pipeline script
///
/// Plugins are always unregistered before returning, whether or not the
/// pipeline succeeded.
pub async fn run(
    file: &str,
    params: Vec<(String, String)>,
    json: bool,
    config: &Config,
) -> Result<()> {
    let parsed = pipeline::load(file)?;
    let source =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;

    let runtime = Arc::new(CliContainerRuntime::new(
        config.runner.container_binary.clone(),
    ));
    if uses_containers(&parsed) {
        if let Err(e) = runtime.check_available().await {
            warn!("{:#}", e);
        }
    }

    let logs: Arc<dyn LogBufferService> = Arc::new(InMemoryLogBuffer::new());
    let registry = builtin_registry(config, logs.clone(), runtime.clone()).await?;

    let engine = Arc::new(Engine::new(
        registry.clone(),
        runtime,
        logs.clone(),
        config.runner.retry_policy(),
    ));
    let launcher = WorkflowLauncher::new(engine, logs, config.runner.max_parallel_workflows);

    let properties = params
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    let outcome = execute(&launcher, &source, properties, json).await;
    shutdown(&registry).await;
    outcome
}

async fn execute(
    launcher: &WorkflowLauncher,
    source: &str,
    properties: HashMap<String, Value>,
    json: bool,
) -> Result<()> {
    let id = launcher.submit(source, properties)?;

    if !json {
        println!("{} {}", "Workflow".bold(), id.cyan());
        println!("{}", "─".repeat(80).dimmed());
    }

    let mut ticker = tokio::time::interval(TAIL_INTERVAL);
    loop {
        ticker.tick().await;

        let done = launcher.query_state(&id).is_done();
        let entries = launcher.logs(&id);
        if !json {
            entries.iter().for_each(print_log_entry);
        }
        if done {
            break;
        }
    }

    let report = launcher.wait(&id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", "─".repeat(80).dimmed());
        print_report(&report);
    }

    match &report.failure {
        Some(failure) => anyhow::bail!("stage '{}' failed", failure.stage),
        None => Ok(()),
    }
}

fn uses_containers(pipeline: &Pipeline) -> bool {
    fn stage_uses(stage: &Stage) -> bool {
        matches!(stage.agent, Some(Agent::Docker { .. })) || stage.parallel.iter().any(stage_uses)
    }

    matches!(pipeline.agent, Agent::Docker { .. }) || pipeline.stages.iter().any(stage_uses)
}

fn print_report(report: &ExecutionReport) {
    println!("{}", "Results:".bold());
    print_results(&report.stages, 1);

    println!();
    match &report.failure {
        Some(failure) => {
            println!("  {} Stage {} failed", "✗".red(), failure.stage.bold());
            println!("  {}", failure.error.red());
        }
        None => println!("  {} All stages succeeded", "✓".green()),
    }
}

fn print_results(results: &StageResults, depth: usize) {
    let indent = "  ".repeat(depth);

    for (name, output) in results.iter() {
        println!("{}{} {}", indent, "▸".cyan(), name.bold());

        if let Some(branches) = output.branches() {
            print_results(branches, depth + 1);
        }

        for step in output.steps().unwrap_or_default() {
            for line in step.lines() {
                println!("{}    {}", indent, line.dimmed());
            }
        }
    }
}

/// Print a log entry
fn print_log_entry(log: &LogEntry) {
    let level_str = log.level.to_string();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "{} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        log.message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("branch=main").unwrap(),
            ("branch".to_string(), "main".to_string())
        );
        assert_eq!(
            parse_key_val("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_uses_containers_looks_into_branches() {
        let host = lathe_dsl::parse_pipeline(
            "pipeline { agent none stages { stage('a') { steps { sh 'x' } } } }",
        )
        .unwrap();
        assert!(!uses_containers(&host));

        let nested = lathe_dsl::parse_pipeline(
            "pipeline { agent none stages { stage('a') { parallel {
                stage('b') { agent { docker 'alpine' } steps { sh 'x' } }
            } } } }",
        )
        .unwrap();
        assert!(uses_containers(&nested));
    }
}
