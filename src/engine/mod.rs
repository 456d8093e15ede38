//! The gateway core: pool, instances, and the chat turn engine.

pub mod functions;
pub mod instance;
pub mod pool;
mod turn;

pub use instance::Instance;
pub use pool::{ModelStatus, Pool, PoolStatus};

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::chat::ChatMessage;
use crate::config::SamplingOverrides;
use crate::engine::functions::{FunctionDef, SurfacedCall};
use crate::runtime::{RuntimeStopReason, TokenId};

/// Why a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FinishReason {
    /// The model emitted an end-of-generation token
    EogToken,
    /// The max-tokens limit was reached
    MaxTokens,
    /// A built-in or custom stop trigger fired
    StopTrigger,
    /// One or more function calls were surfaced to the caller
    FunctionCall,
    /// The caller aborted
    Abort,
    /// Generation failed mid-stream
    Error,
}

impl FinishReason {
    pub(crate) fn from_stop(reason: RuntimeStopReason) -> Self {
        match reason {
            RuntimeStopReason::FunctionCalls => FinishReason::FunctionCall,
            RuntimeStopReason::StopGenerationTrigger | RuntimeStopReason::CustomStopTrigger => {
                FinishReason::StopTrigger
            }
            RuntimeStopReason::MaxTokens => FinishReason::MaxTokens,
            RuntimeStopReason::EogToken => FinishReason::EogToken,
            RuntimeStopReason::Abort => FinishReason::Abort,
        }
    }
}

/// Token accounting for one request, as meter deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Streaming sink handed to the pool: (token ids, detokenized text).
pub type ChunkCallback = Box<dyn FnMut(&[TokenId], &str) + Send>;

/// A chat-completion request against a named model.
#[derive(Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingOverrides,
    /// Name of a grammar compiled into the instance. When set, functions
    /// are ignored for this request (grammar wins, by rule).
    pub grammar: Option<String>,
    /// Request-level functions, merged over the model config's by name
    pub functions: HashMap<String, FunctionDef>,
    pub stop_triggers: Vec<String>,
    pub token_bias: HashMap<TokenId, f32>,
    /// Discard the instance's warm state before serving
    pub reset_context: bool,
}

/// Result of a chat-completion request.
#[derive(Debug)]
pub struct ChatResult {
    /// Assistant text. Empty when calls were surfaced.
    pub content: String,
    /// Surfaced function calls awaiting results from the caller
    pub function_calls: Vec<SurfacedCall>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// A text-completion request. Never touches chat state.
#[derive(Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub sampling: SamplingOverrides,
    pub cpu_threads: Option<usize>,
    pub batch_size: Option<usize>,
}

/// Result of a text-completion request.
#[derive(Debug)]
pub struct CompletionResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// An embedding request. Non-string inputs are dropped silently.
#[derive(Default)]
pub struct EmbeddingRequest {
    pub inputs: Vec<Value>,
}

/// Result of an embedding request.
#[derive(Debug)]
pub struct EmbeddingResult {
    pub vectors: Vec<Vec<f32>>,
    pub usage: TokenUsage,
}
