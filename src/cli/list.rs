//! List configured models

use std::path::PathBuf;

use anyhow::Result;

/// Print the configured models and whether their weight files exist.
pub async fn list(config: PathBuf) -> Result<()> {
    let config = super::load_config(&config)?;

    if config.models.is_empty() {
        println!("No models configured.");
        return Ok(());
    }

    println!("Models ({}):\n", config.models_dir().display());

    let mut names: Vec<&String> = config.models.keys().collect();
    names.sort();
    for name in names {
        let model = &config.models[name];
        let file = config.model_file(model);
        let state = if file.exists() {
            "present"
        } else if model.url.is_some() {
            "missing (url configured, run `corral pull`)"
        } else {
            "missing (no url)"
        };
        println!("  {} - {} [{}]", name, file.display(), state);
        if !model.functions.is_empty() {
            let mut functions: Vec<&String> = model.functions.keys().collect();
            functions.sort();
            println!("    functions: {}", functions.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "));
        }
        if !model.grammars.is_empty() {
            let mut grammars: Vec<&String> = model.grammars.keys().collect();
            grammars.sort();
            println!("    grammars: {}", grammars.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "));
        }
    }

    Ok(())
}
