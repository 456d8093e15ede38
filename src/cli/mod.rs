//! CLI commands
//!
//! Gateway operations: serve the HTTP API, pre-fetch model weights, and
//! inspect the configured models.

mod list;
mod pull;
mod serve;

pub use list::list;
pub use pull::pull;
pub use serve::serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Corral - local LLM inference gateway
#[derive(Parser)]
#[command(name = "corral")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Gateway configuration file (YAML or JSON)
        #[arg(long, short)]
        config: PathBuf,

        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Download weight files for configured models
    Pull {
        /// Gateway configuration file (YAML or JSON)
        #[arg(long, short)]
        config: PathBuf,

        /// Models to fetch (default: every model with a url)
        models: Vec<String>,
    },

    /// List configured models and whether their weights are on disk
    List {
        /// Gateway configuration file (YAML or JSON)
        #[arg(long, short)]
        config: PathBuf,
    },
}

/// Load a gateway config, picking the parser from the file extension.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<crate::config::GatewayConfig> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => crate::config::GatewayConfig::from_json(path),
        _ => crate::config::GatewayConfig::from_yaml(path),
    }
}
