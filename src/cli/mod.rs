//! CLI module for orgflow
//!
//! Commands:
//! - `run`: Start the controller (default)
//! - `check`: Evaluate and print the bootstrap stage
//! - `check-config`: Resolve the broker configuration and print the plan
//! - `publish`: Publish a change event (trigger producer)

use clap::{Parser, Subcommand};

pub mod check;
pub mod check_config;
pub mod publish;

/// Organization orchestration controller
#[derive(Parser, Debug)]
#[command(name = "orgflow")]
#[command(about = "Event-driven organization orchestration controller")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the controller (default)
    Run {
        /// Use an in-process broker instead of NATS
        #[arg(long)]
        memory: bool,
    },
    /// Connect to the broker and print the bootstrap stage
    Check,
    /// Resolve the broker configuration and print the connection plan
    CheckConfig,
    /// Publish a change event
    Publish {
        /// Event type, e.g. template_changed
        #[arg(long)]
        event_type: String,
        /// Target repository or resource, e.g. acme/.github
        #[arg(long)]
        target: String,
        /// Event data as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Organization; defaults to the configured one
        #[arg(long)]
        organization: Option<String>,
        /// Idempotency key; repeats inside the dedup window are dropped
        #[arg(long)]
        id: Option<String>,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Commands::Run { memory: false }) {
        Commands::Run { memory } => {
            crate::server::run(crate::server::RunOptions { memory }).await
        }
        Commands::Check => check::run().await,
        Commands::CheckConfig => check_config::run(),
        Commands::Publish {
            event_type,
            target,
            data,
            organization,
            id,
        } => {
            publish::run(publish::PublishArgs {
                event_type,
                target,
                data,
                organization,
                id,
            })
            .await
        }
    }
}
