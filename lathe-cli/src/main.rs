//! Lathe CLI
//!
//! Command-line interface for parsing and running declarative pipelines.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lathe")]
#[command(about = "Lathe pipeline compiler and runner", long_about = None)]
struct Cli {
    /// Docker-compatible CLI used for containerized stages
    #[arg(long, env = "LATHE_CONTAINER_BINARY", global = true)]
    container_binary: Option<String>,

    /// Host workspace for checkouts and host shell steps
    #[arg(long, env = "LATHE_WORKSPACE", global = true)]
    workspace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lathe=info,lathe_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config::load(cli.container_binary, cli.workspace)?;

    handle_command(cli.command, &config).await
}
