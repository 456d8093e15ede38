//! Scripted in-memory runtime backend for pool and turn-engine tests.
//!
//! Contexts replay a shared queue of [`ScriptedTurn`]s and record an event
//! log the tests assert on: which context served which call, whether a
//! prior evaluation was reused, what constraint was in force.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::chat::{HistoryItem, ResponseSegment};

/// One scripted generation round.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// Text chunks streamed through the token sink, in order
    pub chunks: Vec<String>,
    /// Function calls emitted after the text, in order
    pub calls: Vec<(String, Value)>,
    /// Stop reason; None picks FunctionCalls/EogToken from the shape
    pub stop_reason: Option<RuntimeStopReason>,
    /// Stream the chunks, then block until the call is aborted
    pub hang_until_cancelled: bool,
    /// Stream the chunks, then fail the call
    pub failure: Option<ScriptedFailure>,
}

/// How a scripted turn fails after streaming its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Generation,
    ContextUnusable,
}

impl ScriptedTurn {
    pub fn text(content: &str) -> Self {
        ScriptedTurn {
            chunks: vec![content.to_string()],
            ..Default::default()
        }
    }

    pub fn calls(calls: Vec<(&str, Value)>) -> Self {
        ScriptedTurn {
            calls: calls
                .into_iter()
                .map(|(n, p)| (n.to_string(), p))
                .collect(),
            ..Default::default()
        }
    }

    pub fn hang() -> Self {
        ScriptedTurn {
            chunks: vec!["partial".to_string()],
            hang_until_cancelled: true,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        ScriptedTurn {
            chunks: vec!["partial".to_string()],
            failure: Some(ScriptedFailure::Generation),
            ..Default::default()
        }
    }

    pub fn poisoned() -> Self {
        ScriptedTurn {
            chunks: vec!["partial".to_string()],
            failure: Some(ScriptedFailure::ContextUnusable),
            ..Default::default()
        }
    }

    pub fn with_stop(mut self, reason: RuntimeStopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }
}

/// What the backend observed, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptEvent {
    ModelLoaded { file: String },
    ModelDropped { file: String },
    ContextCreated { ctx: usize },
    ContextDropped { ctx: usize },
    Preloaded { ctx: usize, items: usize },
    Generated {
        ctx: usize,
        reused_evaluation: bool,
        grammar: bool,
        functions: Vec<String>,
    },
    Completed { ctx: usize },
    Embedded { ctx: usize, tokens: usize },
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<ScriptedTurn>>,
    events: Mutex<Vec<ScriptEvent>>,
    next_ctx: AtomicUsize,
    live_models: AtomicUsize,
    max_live_models: AtomicUsize,
    fail_loads: Mutex<Vec<String>>,
}

impl Shared {
    fn record(&self, event: ScriptEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// The backend handed to the pool under test.
#[derive(Default)]
pub struct ScriptedBackend {
    shared: Arc<Shared>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.shared.script.lock().unwrap().push_back(turn);
    }

    /// Make loads of any path containing `needle` fail.
    pub fn fail_loads_matching(&self, needle: &str) {
        self.shared.fail_loads.lock().unwrap().push(needle.to_string());
    }

    pub fn events(&self) -> Vec<ScriptEvent> {
        self.shared.events.lock().unwrap().clone()
    }

    pub fn live_models(&self) -> usize {
        self.shared.live_models.load(Ordering::SeqCst)
    }

    pub fn max_live_models(&self) -> usize {
        self.shared.max_live_models.load(Ordering::SeqCst)
    }

    /// Context ids of generate calls, in order.
    pub fn generate_ctxs(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ScriptEvent::Generated { ctx, .. } => Some(ctx),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RuntimeBackend for ScriptedBackend {
    async fn load_model(
        &self,
        options: ModelLoadOptions,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Arc<dyn LoadedModel>> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }
        let file = options
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let failing = self.shared.fail_loads.lock().unwrap();
        if failing.iter().any(|needle| file.contains(needle.as_str())) {
            return Err(RuntimeError::ModelLoad(format!("scripted failure for {file}")));
        }
        drop(failing);

        let live = self.shared.live_models.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live_models.fetch_max(live, Ordering::SeqCst);
        self.shared.record(ScriptEvent::ModelLoaded { file: file.clone() });
        Ok(Arc::new(ScriptedModel {
            shared: Arc::clone(&self.shared),
            file,
        }))
    }
}

struct ScriptedModel {
    shared: Arc<Shared>,
    file: String,
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.shared.live_models.fetch_sub(1, Ordering::SeqCst);
        self.shared.record(ScriptEvent::ModelDropped {
            file: self.file.clone(),
        });
    }
}

struct ScriptedGrammar;
impl Grammar for ScriptedGrammar {}

#[async_trait]
impl LoadedModel for ScriptedModel {
    async fn create_chat_context(
        &self,
        _options: ContextOptions,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Box<dyn ChatContext>> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }
        Ok(Box::new(ScriptedContext::new(Arc::clone(&self.shared))))
    }

    async fn create_completion_context(
        &self,
        _options: ContextOptions,
        _cancel: &CancellationToken,
    ) -> RuntimeResult<Box<dyn CompletionContext>> {
        Ok(Box::new(ScriptedContext::new(Arc::clone(&self.shared))))
    }

    async fn create_embedding_context(
        &self,
        _options: ContextOptions,
    ) -> RuntimeResult<Box<dyn EmbeddingContext>> {
        Ok(Box::new(ScriptedContext::new(Arc::clone(&self.shared))))
    }

    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, _)| i as TokenId)
            .collect()
    }

    fn detokenize(&self, tokens: &[TokenId]) -> String {
        format!("<{} tokens>", tokens.len())
    }

    fn compile_grammar(&self, source: &str) -> RuntimeResult<Arc<dyn Grammar>> {
        if source.contains("!invalid") {
            return Err(RuntimeError::Grammar("scripted parse failure".into()));
        }
        Ok(Arc::new(ScriptedGrammar))
    }

    fn render_function_call(&self, name: &str, params: &Value, result: &Value) -> String {
        format!("[[{name}({params}) -> {result}]]")
    }
}

struct ScriptedContext {
    shared: Arc<Shared>,
    id: usize,
    meter: TokenMeter,
}

impl ScriptedContext {
    fn new(shared: Arc<Shared>) -> Self {
        let id = shared.next_ctx.fetch_add(1, Ordering::SeqCst);
        shared.record(ScriptEvent::ContextCreated { ctx: id });
        ScriptedContext {
            shared,
            id,
            meter: TokenMeter::default(),
        }
    }

    fn next_turn(&self) -> RuntimeResult<ScriptedTurn> {
        self.shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RuntimeError::Generation("script exhausted".into()))
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.shared.record(ScriptEvent::ContextDropped { ctx: self.id });
    }
}

fn finished_history(history: &[HistoryItem], text: &str) -> Vec<HistoryItem> {
    let mut out = history.to_vec();
    if !matches!(out.last(), Some(HistoryItem::Model(_))) {
        out.push(HistoryItem::Model(Vec::new()));
    }
    if !text.is_empty() {
        if let Some(HistoryItem::Model(segments)) = out.last_mut() {
            segments.push(ResponseSegment::Text(text.to_string()));
        }
    }
    out
}

fn evaluation_for(history: Vec<HistoryItem>) -> LastEvaluation {
    LastEvaluation {
        context_window: history.clone(),
        clean_history: history,
        context_shift: Some(ContextShiftState(Arc::new(()))),
    }
}

#[async_trait]
impl ChatContext for ScriptedContext {
    async fn generate_response(
        &mut self,
        request: GenerateRequest<'_>,
        on_token: TokenSink<'_>,
        cancel: &CancellationToken,
    ) -> RuntimeResult<GenerateOutcome> {
        let turn = self.next_turn()?;

        self.shared.record(ScriptEvent::Generated {
            ctx: self.id,
            reused_evaluation: request.last_evaluation.is_some(),
            grammar: matches!(request.constraint, GenerateConstraint::Grammar(_)),
            functions: match &request.constraint {
                GenerateConstraint::Functions { declarations, .. } => {
                    declarations.iter().map(|d| d.name.clone()).collect()
                }
                _ => Vec::new(),
            },
        });

        self.meter.used_input_tokens += request.history.len() as u64;

        let mut streamed = String::new();
        for (i, chunk) in turn.chunks.iter().enumerate() {
            on_token(&[i as TokenId], chunk);
            streamed.push_str(chunk);
            self.meter.used_output_tokens += 1;
        }

        if turn.hang_until_cancelled {
            cancel.cancelled().await;
            return Ok(GenerateOutcome {
                function_calls: Vec::new(),
                last_evaluation: evaluation_for(finished_history(request.history, &streamed)),
                stop_reason: RuntimeStopReason::Abort,
            });
        }

        if let Some(failure) = turn.failure {
            return Err(match failure {
                ScriptedFailure::Generation => {
                    RuntimeError::Generation("scripted generation failure".into())
                }
                ScriptedFailure::ContextUnusable => {
                    RuntimeError::ContextUnusable("scripted poisoning".into())
                }
            });
        }

        let function_calls: Vec<EmittedFunctionCall> = turn
            .calls
            .iter()
            .map(|(name, params)| EmittedFunctionCall {
                name: name.clone(),
                params: params.clone(),
                raw: format!("[call:{name}]"),
            })
            .collect();

        let stop_reason = turn.stop_reason.unwrap_or(if function_calls.is_empty() {
            RuntimeStopReason::EogToken
        } else {
            RuntimeStopReason::FunctionCalls
        });

        Ok(GenerateOutcome {
            function_calls,
            last_evaluation: evaluation_for(finished_history(request.history, &streamed)),
            stop_reason,
        })
    }

    async fn preload_history(
        &mut self,
        history: &[HistoryItem],
        _cancel: &CancellationToken,
    ) -> RuntimeResult<LastEvaluation> {
        self.shared.record(ScriptEvent::Preloaded {
            ctx: self.id,
            items: history.len(),
        });
        self.meter.used_input_tokens += history.len() as u64;
        Ok(evaluation_for(history.to_vec()))
    }

    fn token_meter(&self) -> TokenMeter {
        self.meter
    }
}

#[async_trait]
impl CompletionContext for ScriptedContext {
    async fn generate_completion(
        &mut self,
        prompt_tokens: &[TokenId],
        _sampling: &SamplingConfig,
        on_token: TokenSink<'_>,
        cancel: &CancellationToken,
    ) -> RuntimeResult<CompletionOutcome> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Aborted);
        }
        let turn = self.next_turn()?;
        self.shared.record(ScriptEvent::Completed { ctx: self.id });
        self.meter.used_input_tokens += prompt_tokens.len() as u64;

        let mut text = String::new();
        for (i, chunk) in turn.chunks.iter().enumerate() {
            on_token(&[i as TokenId], chunk);
            text.push_str(chunk);
            self.meter.used_output_tokens += 1;
        }

        Ok(CompletionOutcome {
            text,
            stop_reason: turn.stop_reason.unwrap_or(RuntimeStopReason::EogToken),
        })
    }

    fn reset(&mut self) {}

    fn token_meter(&self) -> TokenMeter {
        self.meter
    }
}

#[async_trait]
impl EmbeddingContext for ScriptedContext {
    async fn embed(&mut self, tokens: &[TokenId]) -> RuntimeResult<Vec<f32>> {
        self.shared.record(ScriptEvent::Embedded {
            ctx: self.id,
            tokens: tokens.len(),
        });
        Ok(vec![tokens.len() as f32, 0.5, -0.5])
    }
}

/// Scripts keyed by nothing still need deterministic model paths; tests
/// use this helper to build a config pointing at pre-created temp files.
pub fn touch_model_file(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"weights").unwrap();
    path
}

/// Convenience: a single-model gateway config rooted at `dir`.
pub fn single_model_config(
    dir: &std::path::Path,
    model: &str,
    concurrency: usize,
) -> crate::config::GatewayConfig {
    let mut models = HashMap::new();
    models.insert(
        model.to_string(),
        crate::config::ModelConfig {
            file: touch_model_file(dir, &format!("{model}.gguf")),
            url: None,
            context_size: 4096,
            engine: Default::default(),
            grammars: HashMap::new(),
            functions: HashMap::new(),
            preload: None,
            completion_defaults: None,
        },
    );
    crate::config::GatewayConfig {
        concurrency,
        models_dir: Some(dir.to_path_buf()),
        log_level: None,
        server: None,
        models,
    }
}
