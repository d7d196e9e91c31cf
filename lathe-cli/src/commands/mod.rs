//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod pipeline;
mod plugins;
mod run;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Parse a pipeline script and print its structure
    Parse {
        /// Path to the pipeline script
        file: String,

        /// Print the parsed pipeline as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a pipeline script for syntax errors
    Validate {
        /// Path to the pipeline script
        file: String,
    },
    /// Run a pipeline with the built-in plugins
    Run {
        /// Path to the pipeline script
        file: String,

        /// Execution properties as key=value pairs
        #[arg(short, long, value_parser = run::parse_key_val)]
        param: Vec<(String, String)>,

        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the commands provided by the built-in plugins
    Plugins,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Parse { file, json } => pipeline::parse(&file, json),
        Commands::Validate { file } => pipeline::validate(&file),
        Commands::Run { file, param, json } => run::run(&file, param, json, config).await,
        Commands::Plugins => plugins::list(config).await,
    }
}
