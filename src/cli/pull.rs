//! Pre-fetch model weight files

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::download::Downloader;

/// Download the weight files of the named models (default: every model
/// with a configured url) into the models dir.
pub async fn pull(config: PathBuf, models: Vec<String>) -> Result<()> {
    let config = super::load_config(&config)?;

    let names: Vec<String> = if models.is_empty() {
        let mut names: Vec<String> = config
            .models
            .iter()
            .filter(|(_, m)| m.url.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    } else {
        models
    };

    if names.is_empty() {
        println!("No models with a configured url.");
        return Ok(());
    }

    let downloader = Downloader::new();
    for name in &names {
        let Some(model) = config.models.get(name) else {
            bail!("unknown model '{name}'");
        };
        let file = config.model_file(model);
        if file.exists() {
            println!("  {} - already present ({})", name, file.display());
            continue;
        }
        println!("  {} - downloading...", name);
        downloader.prepare(&file, model.url.as_deref()).await?;
        println!("  {} - done ({})", name, file.display());
    }

    Ok(())
}
