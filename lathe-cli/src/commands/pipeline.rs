//! Pipeline inspection commands
//!
//! Parses scripts without running them: `parse` prints the structure,
//! `validate` only reports whether the script is accepted.

use anyhow::{Context, Result};
use colored::*;
use lathe_core::domain::pipeline::{Agent, Pipeline, Stage, Step};
use lathe_dsl::{ParseError, parse_pipeline};

/// Reads and parses a pipeline script
pub fn load(file: &str) -> Result<Pipeline> {
    let source =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;

    parse_pipeline(&source).map_err(|e| {
        print_parse_error(file, &e);
        anyhow::anyhow!("{} is not a valid pipeline", file)
    })
}

/// Print the parsed pipeline
pub fn parse(file: &str, json: bool) -> Result<()> {
    let pipeline = load(file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pipeline)?);
        return Ok(());
    }

    println!("{} {}", "Pipeline".bold(), file.dimmed());
    println!("  Agent: {}", describe_agent(&pipeline.agent));
    println!();
    for stage in &pipeline.stages {
        print_stage(stage, 1);
    }

    Ok(())
}

/// Check a pipeline script
pub fn validate(file: &str) -> Result<()> {
    let pipeline = load(file)?;

    println!(
        "{} {} ({} stage(s))",
        "✓".green(),
        file,
        pipeline.stages.len()
    );
    Ok(())
}

fn print_parse_error(file: &str, err: &ParseError) {
    let location = match err.position() {
        Some((line, column)) => format!("{}:{}:{}", file, line, column),
        None => file.to_string(),
    };
    eprintln!("{} {}: {}", "✗".red(), location.bold(), err);
}

fn print_stage(stage: &Stage, depth: usize) {
    let indent = "  ".repeat(depth);

    println!("{}{} {}", indent, "▸".cyan(), stage.name.bold());
    if let Some(agent) = &stage.agent {
        println!("{}  Agent: {}", indent, describe_agent(agent));
    }
    if stage.is_fail_fast() {
        println!("{}  {}", indent, "failFast".yellow());
    }

    for step in &stage.steps {
        println!("{}  {}", indent, describe_step(step));
    }

    for branch in &stage.parallel {
        print_stage(branch, depth + 1);
    }
}

fn describe_agent(agent: &Agent) -> String {
    match agent {
        Agent::None => "none".to_string(),
        Agent::Docker { image } => format!("docker {}", image.cyan()),
    }
}

fn describe_step(step: &Step) -> String {
    match step {
        Step::SingleKV { command, value } => format!("{} '{}'", command.cyan(), value),
        Step::MultiKV { command, params } => {
            let params: Vec<_> = params
                .iter()
                .map(|p| format!("{}: '{}'", p.key, p.value))
                .collect();
            format!("{} {}", command.cyan(), params.join(", "))
        }
    }
}
