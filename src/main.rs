use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corral::cli::{load_config, Cli, Commands};

/// Initialize logging. RUST_LOG wins; the config's log_level is the
/// fallback default for `serve`.
fn init_logging(default_level: Option<&str>) {
    let fallback = match default_level {
        Some(level) => format!("corral={level},tower_http=debug"),
        None => "corral=info,tower_http=debug".to_string(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let config = load_config(&config)?;
            init_logging(config.log_level.as_deref());
            corral::cli::serve(config, host, port).await?;
        }
        Commands::Pull { config, models } => {
            init_logging(None);
            corral::cli::pull(config, models).await?;
        }
        Commands::List { config } => {
            init_logging(None);
            corral::cli::list(config).await?;
        }
    }

    Ok(())
}
