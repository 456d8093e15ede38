//! Inference runtime adapter
//!
//! The narrow waist between the gateway and whatever engine actually does
//! the tensor math. The pool and turn engine depend on *adapter behavior*,
//! not on an implementation: backends plug in behind [`RuntimeBackend`]
//! without changing gateway code.
//!
//! Everything long-running is async and takes a cancellation token. All
//! resources (models, contexts, grammars) release on `Drop`.

#[cfg(test)]
pub(crate) mod testing;

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::chat::HistoryItem;
use crate::config::{GpuMode, SamplingConfig};

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Failures reported by the runtime adapter.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("model loading failed: {0}")]
    ModelLoad(String),
    #[error("context creation failed: {0}")]
    ContextCreation(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("grammar compilation failed: {0}")]
    Grammar(String),
    /// The context can no longer be used; the owning instance must be
    /// disposed.
    #[error("context unusable: {0}")]
    ContextUnusable(String),
    #[error("operation aborted")]
    Aborted,
}

/// Parameters for loading a model from disk.
#[derive(Debug, Clone)]
pub struct ModelLoadOptions {
    pub path: PathBuf,
    pub gpu: GpuMode,
    pub gpu_layers: Option<u32>,
    pub mem_lock: bool,
}

/// Parameters for creating a context over a loaded model.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub context_size: usize,
    pub seed: Option<u64>,
    pub cpu_threads: Option<usize>,
    pub batch_size: Option<usize>,
}

/// Entry point: loads models.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    async fn load_model(
        &self,
        options: ModelLoadOptions,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Arc<dyn LoadedModel>>;
}

static BACKEND: std::sync::OnceLock<Arc<dyn RuntimeBackend>> = std::sync::OnceLock::new();

/// Install the process-wide runtime backend.
///
/// The gateway carries no inference engine of its own; an embedding
/// application links one in and registers it here once at startup, before
/// `corral serve` builds the pool. Fails if a backend is already
/// installed.
pub fn install_backend(backend: Arc<dyn RuntimeBackend>) -> Result<(), Arc<dyn RuntimeBackend>> {
    BACKEND.set(backend)
}

/// The backend registered with [`install_backend`], if any.
pub fn installed_backend() -> Option<Arc<dyn RuntimeBackend>> {
    BACKEND.get().cloned()
}

/// A loaded model. Contexts, grammars, and token conversion hang off it.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Create a chat context with a single decoding sequence.
    async fn create_chat_context(
        &self,
        options: ContextOptions,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Box<dyn ChatContext>>;

    /// Create a context for raw text completion.
    async fn create_completion_context(
        &self,
        options: ContextOptions,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Box<dyn CompletionContext>>;

    /// Create an embedding context.
    async fn create_embedding_context(
        &self,
        options: ContextOptions,
    ) -> RuntimeResult<Box<dyn EmbeddingContext>>;

    fn tokenize(&self, text: &str) -> Vec<TokenId>;

    fn detokenize(&self, tokens: &[TokenId]) -> String;

    /// Compile a grammar from source text.
    fn compile_grammar(&self, source: &str) -> RuntimeResult<Arc<dyn Grammar>>;

    /// Render a resolved function call in the model's native
    /// function-call syntax, for splicing results back into history.
    fn render_function_call(&self, name: &str, params: &Value, result: &Value) -> String;
}

/// A compiled grammar. Opaque to the gateway.
pub trait Grammar: Send + Sync {}

/// A function the model may call, as the runtime needs to see it.
#[derive(Debug, Clone)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON-schema parameter description
    pub parameters: Value,
}

/// Output constraint for one generation call. Grammar and functions are
/// mutually exclusive by construction.
pub enum GenerateConstraint {
    None,
    Grammar(Arc<dyn Grammar>),
    Functions {
        declarations: Vec<FunctionDeclaration>,
        document_params: bool,
        max_parallel: usize,
    },
}

/// A function call emitted by the model during generation.
#[derive(Debug, Clone)]
pub struct EmittedFunctionCall {
    pub name: String,
    pub params: Value,
    /// The call as it appeared in the model's own syntax
    pub raw: String,
}

/// Why a generation call stopped, in the runtime's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStopReason {
    FunctionCalls,
    StopGenerationTrigger,
    CustomStopTrigger,
    MaxTokens,
    EogToken,
    Abort,
}

/// Adapter-owned context-shift handle. The gateway threads it back into
/// the next generation call and never looks inside.
#[derive(Clone)]
pub struct ContextShiftState(pub Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for ContextShiftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContextShiftState(..)")
    }
}

/// Everything the next generation call needs to resume the prefix cache
/// without re-tokenizing shared history.
#[derive(Debug, Clone)]
pub struct LastEvaluation {
    /// The history as the runtime settled it after the call
    pub clean_history: Vec<HistoryItem>,
    /// The portion of history currently materialized in the context
    /// window
    pub context_window: Vec<HistoryItem>,
    /// Opaque context-shift metadata
    pub context_shift: Option<ContextShiftState>,
}

/// One generation call against a chat context.
pub struct GenerateRequest<'a> {
    pub history: &'a [HistoryItem],
    pub sampling: &'a SamplingConfig,
    pub token_bias: &'a HashMap<TokenId, f32>,
    pub stop_triggers: &'a [String],
    pub constraint: GenerateConstraint,
    /// Prefix-cache anchor from the previous call on this context
    pub last_evaluation: Option<&'a LastEvaluation>,
    /// Minimum overlap with the previous context window below which the
    /// runtime shifts instead of reusing
    pub minimum_overlap_ratio: f32,
    pub trim_whitespace_suffix: bool,
    pub stop_on_abort: bool,
}

/// Result of a generation call.
pub struct GenerateOutcome {
    /// Calls the model emitted this round, in emission order. Empty when
    /// the model produced a final answer.
    pub function_calls: Vec<EmittedFunctionCall>,
    pub last_evaluation: LastEvaluation,
    pub stop_reason: RuntimeStopReason,
}

/// Result of a completion call.
pub struct CompletionOutcome {
    pub text: String,
    pub stop_reason: RuntimeStopReason,
}

/// Streaming sink for generated tokens: (token ids, detokenized text).
pub type TokenSink<'a> = &'a mut (dyn FnMut(&[TokenId], &str) + Send);

/// Cumulative token counts for one sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenMeter {
    pub used_input_tokens: u64,
    pub used_output_tokens: u64,
}

/// A chat context bound to one decoding sequence.
#[async_trait]
pub trait ChatContext: Send {
    /// Run one generation round over the given history, streaming tokens
    /// into `on_token`. Passing a matching `last_evaluation` preserves
    /// prefix-cache state across calls.
    async fn generate_response(
        &mut self,
        request: GenerateRequest<'_>,
        on_token: TokenSink<'_>,
        cancel: &CancellationToken,
    ) -> RuntimeResult<GenerateOutcome>;

    /// Evaluate a history without generating, so that later requests with
    /// a matching prefix hit a warm cache.
    async fn preload_history(
        &mut self,
        history: &[HistoryItem],
        cancel: &CancellationToken,
    ) -> RuntimeResult<LastEvaluation>;

    /// Cumulative token counts for this context's sequence.
    fn token_meter(&self) -> TokenMeter;
}

/// A completion context. Independent of any chat state.
#[async_trait]
pub trait CompletionContext: Send {
    async fn generate_completion(
        &mut self,
        prompt_tokens: &[TokenId],
        sampling: &SamplingConfig,
        on_token: TokenSink<'_>,
        cancel: &CancellationToken,
    ) -> RuntimeResult<CompletionOutcome>;

    /// Clear the sequence so the context can serve an unrelated prompt.
    fn reset(&mut self);

    fn token_meter(&self) -> TokenMeter;
}

/// An embedding context.
#[async_trait]
pub trait EmbeddingContext: Send {
    async fn embed(&mut self, tokens: &[TokenId]) -> RuntimeResult<Vec<f32>>;
}
