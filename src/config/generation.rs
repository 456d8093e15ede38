//! Sampling configuration

use serde::{Deserialize, Serialize};

/// Sampling parameters for a generation call.
///
/// Model configs declare defaults; requests carry [`SamplingOverrides`]
/// that are merged on top per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for sampling (higher = more random)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-p nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Top-k sampling (None = disabled)
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Min-p sampling threshold (0 = disabled)
    #[serde(default)]
    pub min_p: f32,

    /// Repetition penalty (1.0 = no penalty)
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Window of recent tokens the repeat penalty applies to
    #[serde(default = "default_repeat_last_tokens")]
    pub repeat_last_tokens: usize,

    /// Frequency penalty
    #[serde(default)]
    pub frequency_penalty: f32,

    /// Presence penalty
    #[serde(default)]
    pub presence_penalty: f32,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// Random seed (None = random)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> usize {
    2048
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_repeat_last_tokens() -> usize {
    64
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            min_p: 0.0,
            repeat_penalty: default_repeat_penalty(),
            repeat_last_tokens: default_repeat_last_tokens(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

/// Request-level sampling overrides; every field is optional and wins over
/// the model's defaults when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingOverrides {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub min_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub repeat_last_tokens: Option<usize>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop_sequences: Option<Vec<String>>,
    pub seed: Option<u64>,
}

impl SamplingOverrides {
    /// Merge these overrides over a base configuration.
    pub fn apply(&self, base: &SamplingConfig) -> SamplingConfig {
        SamplingConfig {
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            top_k: self.top_k.or(base.top_k),
            min_p: self.min_p.unwrap_or(base.min_p),
            repeat_penalty: self.repeat_penalty.unwrap_or(base.repeat_penalty),
            repeat_last_tokens: self.repeat_last_tokens.unwrap_or(base.repeat_last_tokens),
            frequency_penalty: self.frequency_penalty.unwrap_or(base.frequency_penalty),
            presence_penalty: self.presence_penalty.unwrap_or(base.presence_penalty),
            stop_sequences: self
                .stop_sequences
                .clone()
                .unwrap_or_else(|| base.stop_sequences.clone()),
            seed: self.seed.or(base.seed),
        }
    }
}
