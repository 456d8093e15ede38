//! Per-model configuration

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::config::generation::SamplingOverrides;
use crate::engine::functions::FunctionDef;

/// Configuration for one named model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Weight file; relative paths resolve against the gateway models dir.
    pub file: PathBuf,

    /// Source URL for the weight file. When the file is absent on disk,
    /// the downloader fetches it from here before an instance is created.
    #[serde(default)]
    pub url: Option<String>,

    /// Context window size in tokens
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    /// Engine options forwarded to the runtime
    #[serde(default)]
    pub engine: EngineOptions,

    /// Named grammars (name → grammar source text), compiled once per
    /// instance
    #[serde(default)]
    pub grammars: HashMap<String, String>,

    /// Functions the model may call. Handlers cannot come from a config
    /// file; the embedding application registers them on the loaded
    /// config.
    #[serde(default)]
    pub functions: HashMap<String, FunctionDef>,

    /// Seed state evaluated at instance creation so matching requests hit
    /// a warm prefix cache
    #[serde(default)]
    pub preload: Option<Preload>,

    /// Default sampling parameters for completion requests
    #[serde(default)]
    pub completion_defaults: Option<SamplingOverrides>,
}

fn default_context_size() -> usize {
    4096
}

/// Engine options forwarded opaquely to the runtime adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    /// GPU backend selection
    #[serde(default)]
    pub gpu: GpuMode,

    /// Number of layers to offload to the GPU (None = runtime decides)
    #[serde(default)]
    pub gpu_layers: Option<u32>,

    /// CPU threads for evaluation (None = runtime decides)
    #[serde(default)]
    pub cpu_threads: Option<usize>,

    /// Evaluation batch size (None = runtime decides)
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Lock model memory to prevent swapping
    #[serde(default)]
    pub mem_lock: bool,
}

/// GPU backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    #[default]
    Auto,
    Metal,
    Cuda,
    Vulkan,
}

/// Warm-up state fed through the runtime at instance creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Preload {
    /// Seed chat messages; evaluated so that requests sharing the prefix
    /// reuse the cache
    Messages { messages: Vec<ChatMessage> },
    /// Completion prefix preload. Declared but not acted on yet.
    Prefix { prefix: String },
}
