//! Server module for orgflow
//!
//! Contains configuration, the health endpoint and the controller run loop.
//!
//! # Module Structure
//!
//! - `config`: Configuration structures
//! - `loader`: Configuration loading from files and environment
//! - `validation`: Startup and production configuration checks
//! - `health`: `/health` and `/status` endpoints
//! - `init`: Controller initialization and run loop

pub mod config;
mod health;
mod init;
mod loader;
mod validation;

// Re-export public API
pub use init::{build_connector, cli_error, load_validated_config, run, RunOptions};
pub use loader::load_config;
