//! orgflow - event-driven organization orchestration controller
//!
//! CLI entry point.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod server;

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` sets the level for our crates.
fn default_filter(level: Option<&str>) -> String {
    let level = level.unwrap_or("info");
    format!("orgflow={level},orgflow_core={level},tower_http=info")
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        default_filter(std::env::var("LOG_LEVEL").ok().as_deref()).into()
    });
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = cli::Cli::parse();
    cli::run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(
            default_filter(None),
            "orgflow=info,orgflow_core=info,tower_http=info"
        );
        assert!(default_filter(Some("debug")).starts_with("orgflow=debug,orgflow_core=debug"));
    }
}
