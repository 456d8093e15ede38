//! Configuration system for corral
//!
//! A gateway config names the models it fronts, bounds the instance pool,
//! and points at the directory weight files live in.

mod generation;
mod model;
mod server;

pub use generation::{SamplingConfig, SamplingOverrides};
pub use model::{EngineOptions, GpuMode, ModelConfig, Preload};
pub use server::ServerConfig;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum number of live model instances across all models
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Directory weight files are stored in. Defaults to the user cache
    /// dir; overridable with CORRAL_MODELS_DIR.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Default log level for the gateway when RUST_LOG is not set
    /// (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Server settings (only for `corral serve`)
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Named model configurations
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

fn default_concurrency() -> usize {
    1
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            models_dir: None,
            log_level: None,
            server: None,
            models: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Look up a model config by name.
    pub fn model(&self, name: &str) -> std::result::Result<&ModelConfig, GatewayError> {
        self.models
            .get(name)
            .ok_or_else(|| GatewayError::Configuration(format!("unknown model '{name}'")))
    }

    /// The resolved models directory: env override, then config, then the
    /// platform cache dir.
    pub fn models_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("CORRAL_MODELS_DIR") {
            return PathBuf::from(dir);
        }
        if let Some(ref dir) = self.models_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("corral")
    }

    /// Absolute path of a model's weight file.
    pub fn model_file(&self, config: &ModelConfig) -> PathBuf {
        if config.file.is_absolute() {
            config.file.clone()
        } else {
            self.models_dir().join(&config.file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_yaml() {
        let yaml = r#"
concurrency: 2
models_dir: /tmp/corral-models

server:
  port: 9090
  host: 127.0.0.1

models:
  assistant:
    file: llama-8b.gguf
    url: https://example.com/llama-8b.gguf
    context_size: 8192
    engine:
      gpu: metal
      gpu_layers: 32
    grammars:
      json: "root ::= object"
    preload:
      messages:
        - role: system
          content: You are a helpful assistant.
    completion_defaults:
      temperature: 0.7
      max_tokens: 512
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.server.as_ref().unwrap().port, 9090);

        let model = config.model("assistant").unwrap();
        assert_eq!(model.context_size, 8192);
        assert_eq!(model.engine.gpu, GpuMode::Metal);
        assert!(model.grammars.contains_key("json"));
        assert!(matches!(model.preload, Some(Preload::Messages { .. })));
        assert_eq!(
            config.model_file(model),
            PathBuf::from("/tmp/corral-models/llama-8b.gguf")
        );
    }

    #[test]
    fn unknown_model_is_a_configuration_error() {
        let config = GatewayConfig::default();
        let err = config.model("nope").unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
