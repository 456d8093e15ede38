//! Instance lifecycle
//!
//! An instance is one loaded model bound to one chat context, plus the
//! warm per-conversation state that makes prefix-cache routing worthwhile:
//! the canonical chat history, the last evaluation handle, and the table
//! of function calls surfaced to the caller and not yet resolved.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chat::{assemble_history, HistoryItem};
use crate::config::{ModelConfig, Preload, SamplingConfig};
use crate::engine::functions::PendingCall;
use crate::engine::{
    ChunkCallback, CompletionRequest, CompletionResult, EmbeddingRequest, EmbeddingResult,
    FinishReason, TokenUsage,
};
use crate::error::{GatewayError, Result};
use crate::runtime::{
    ChatContext, CompletionContext, ContextOptions, EmbeddingContext, Grammar, LastEvaluation,
    LoadedModel, ModelLoadOptions, RuntimeBackend,
};

/// One loaded model with a single generation context and warm state.
///
/// Exclusively owned by the pool; leased to one request at a time.
pub struct Instance {
    model_name: String,
    model: Arc<dyn LoadedModel>,
    chat: Box<dyn ChatContext>,
    grammars: HashMap<String, Arc<dyn Grammar>>,
    config: ModelConfig,

    pub(crate) chat_history: Vec<HistoryItem>,
    pub(crate) last_evaluation: Option<LastEvaluation>,
    pub(crate) pending_function_calls: HashMap<String, PendingCall>,

    completion: Option<Box<dyn CompletionContext>>,
    embedding: Option<Box<dyn EmbeddingContext>>,
    defunct: bool,
}

impl Instance {
    /// Load the model, create its context, compile the configured
    /// grammars, and run the preload if one is configured. The weight
    /// file must already exist on disk.
    pub async fn create(
        backend: &dyn RuntimeBackend,
        model_name: &str,
        config: &ModelConfig,
        file: PathBuf,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let model = backend
            .load_model(
                ModelLoadOptions {
                    path: file,
                    gpu: config.engine.gpu,
                    gpu_layers: config.engine.gpu_layers,
                    mem_lock: config.engine.mem_lock,
                },
                cancel,
            )
            .await
            .map_err(|e| match e {
                crate::runtime::RuntimeError::Aborted => GatewayError::Cancelled,
                other => GatewayError::Resource(format!("model load failed: {other}")),
            })?;

        let chat = model
            .create_chat_context(Self::context_options(config), cancel)
            .await
            .map_err(|e| GatewayError::Resource(format!("context creation failed: {e}")))?;

        let mut grammars = HashMap::new();
        for (name, source) in &config.grammars {
            let compiled = model.compile_grammar(source).map_err(|e| {
                GatewayError::Configuration(format!("grammar '{name}' failed to compile: {e}"))
            })?;
            grammars.insert(name.clone(), compiled);
        }

        let mut instance = Instance {
            model_name: model_name.to_string(),
            model,
            chat,
            grammars,
            config: config.clone(),
            chat_history: Vec::new(),
            last_evaluation: None,
            pending_function_calls: HashMap::new(),
            completion: None,
            embedding: None,
            defunct: false,
        };
        instance.preload(cancel).await?;
        Ok(instance)
    }

    fn context_options(config: &ModelConfig) -> ContextOptions {
        ContextOptions {
            context_size: config.context_size,
            seed: None,
            cpu_threads: config.engine.cpu_threads,
            batch_size: config.engine.batch_size,
        }
    }

    async fn preload(&mut self, cancel: &CancellationToken) -> Result<()> {
        match &self.config.preload {
            None => {}
            Some(Preload::Messages { messages }) => {
                let history = assemble_history(messages);
                let evaluation = self.chat.preload_history(&history, cancel).await?;
                self.chat_history = evaluation.clean_history.clone();
                self.last_evaluation = Some(evaluation);
                debug!(model = %self.model_name, items = self.chat_history.len(), "preloaded chat state");
            }
            Some(Preload::Prefix { .. }) => {
                debug!(model = %self.model_name, "prefix preload configured; not evaluated");
            }
        }
        Ok(())
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub(crate) fn model(&self) -> &Arc<dyn LoadedModel> {
        &self.model
    }

    pub(crate) fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub(crate) fn chat_context(&mut self) -> &mut dyn ChatContext {
        self.chat.as_mut()
    }

    pub(crate) fn grammar(&self, name: &str) -> Result<Arc<dyn Grammar>> {
        self.grammars
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::Configuration(format!("unknown grammar '{name}'")))
    }

    /// Discard all warm state and rebuild the chat context with a fresh
    /// sequence. Pending calls bound to the old context are lost.
    pub(crate) async fn reset_chat(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.chat = self
            .model
            .create_chat_context(Self::context_options(&self.config), cancel)
            .await
            .map_err(|e| GatewayError::Resource(format!("context creation failed: {e}")))?;
        self.chat_history.clear();
        self.last_evaluation = None;
        self.pending_function_calls.clear();
        Ok(())
    }

    /// Flag the context as reported unusable by the adapter. The pool
    /// disposes the instance instead of returning it to idle.
    pub(crate) fn mark_defunct(&mut self) {
        self.defunct = true;
    }

    pub(crate) fn is_defunct(&self) -> bool {
        self.defunct
    }

    /// After an aborted or failed turn, discard the partial history by
    /// restoring the last successful evaluation.
    pub(crate) fn restore_clean_history(&mut self) {
        if let Some(ref evaluation) = self.last_evaluation {
            self.chat_history = evaluation.clean_history.clone();
        } else {
            self.chat_history.clear();
        }
    }

    /// Serve a text completion. Uses a context separate from the chat
    /// context, so chat history and the last evaluation are untouched.
    pub async fn completion(
        &mut self,
        request: &CompletionRequest,
        mut on_chunk: Option<ChunkCallback>,
        cancel: &CancellationToken,
    ) -> Result<CompletionResult> {
        let defaults = self
            .config
            .completion_defaults
            .as_ref()
            .map(|o| o.apply(&SamplingConfig::default()))
            .unwrap_or_default();
        let sampling = request.sampling.apply(&defaults);

        let needs_fresh_context = request.cpu_threads.is_some()
            || request.batch_size.is_some()
            || sampling.seed.is_some()
            || self.completion.is_none();

        if needs_fresh_context {
            let options = ContextOptions {
                context_size: self.config.context_size,
                seed: sampling.seed,
                cpu_threads: request.cpu_threads.or(self.config.engine.cpu_threads),
                batch_size: request.batch_size.or(self.config.engine.batch_size),
            };
            self.completion = Some(
                self.model
                    .create_completion_context(options, cancel)
                    .await
                    .map_err(|e| {
                        GatewayError::Resource(format!("context creation failed: {e}"))
                    })?,
            );
        }

        let context = self.completion.as_mut().expect("completion context set");
        context.reset();

        let prompt_tokens = self.model.tokenize(&request.prompt);
        let before = context.token_meter();

        let mut sink = |tokens: &[crate::runtime::TokenId], text: &str| {
            if let Some(cb) = on_chunk.as_mut() {
                cb(tokens, text);
            }
        };
        let outcome = context
            .generate_completion(&prompt_tokens, &sampling, &mut sink, cancel)
            .await?;

        let after = context.token_meter();
        Ok(CompletionResult {
            text: outcome.text,
            finish_reason: FinishReason::from_stop(outcome.stop_reason),
            usage: TokenUsage {
                prompt_tokens: after.used_input_tokens - before.used_input_tokens,
                completion_tokens: after.used_output_tokens - before.used_output_tokens,
            },
        })
    }

    /// Serve an embedding request. Strings from a heterogeneous input
    /// array are embedded; everything else is dropped silently.
    pub async fn embeddings(&mut self, request: &EmbeddingRequest) -> Result<EmbeddingResult> {
        if self.embedding.is_none() {
            let options = ContextOptions {
                context_size: self.config.context_size,
                ..Default::default()
            };
            self.embedding = Some(
                self.model
                    .create_embedding_context(options)
                    .await
                    .map_err(|e| {
                        GatewayError::Resource(format!("context creation failed: {e}"))
                    })?,
            );
        }
        let context = self.embedding.as_mut().expect("embedding context set");

        let mut vectors = Vec::new();
        let mut input_tokens = 0u64;
        for input in &request.inputs {
            let Some(text) = input.as_str() else { continue };
            let tokens = self.model.tokenize(text);
            input_tokens += tokens.len() as u64;
            vectors.push(context.embed(&tokens).await?);
        }

        Ok(EmbeddingResult {
            vectors,
            usage: TokenUsage {
                prompt_tokens: input_tokens,
                completion_tokens: 0,
            },
        })
    }
}
