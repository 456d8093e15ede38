//! HTTP request handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::streaming::{
    finish_reason_str, sse_response, ChatStreamChunk, ChatStreamDelta, StreamChoice,
    StreamCompletionChunk, StreamDelta, UsageBody,
};
use crate::chat::ChatMessage;
use crate::config::SamplingOverrides;
use crate::engine::functions::{FunctionDef, SurfacedCall};
use crate::engine::{ChatRequest, ChunkCallback, CompletionRequest, EmbeddingRequest, Pool};
use crate::error::GatewayError;

/// Shared application state
pub struct AppState {
    pub pool: Arc<Pool>,
}

impl AppState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

/// Cancels the in-flight pool request when dropped. The handler future is
/// dropped when the client disconnects; the pool request itself runs on a
/// detached task and winds down through the abort path.
struct AbortOnDrop(CancellationToken);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Gateway error wrapped for HTTP mapping.
pub struct ServerError(GatewayError);

impl From<GatewayError> for ServerError {
    fn from(e: GatewayError) -> Self {
        ServerError(e)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            GatewayError::Configuration(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            GatewayError::Resource(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
            GatewayError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
            GatewayError::ContextUnusable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            GatewayError::UndefinedFunction(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            // 499: client closed request (nginx convention)
            GatewayError::Cancelled => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "request_cancelled",
            ),
            GatewayError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "server_error"),
        };
        let body = Json(json!({
            "error": {
                "message": self.0.to_string(),
                "type": error_type,
                "param": null,
                "code": null,
            }
        }));
        (status, body).into_response()
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// List configured models with their pool status
pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.pool.status().await;
    let mut data: Vec<ModelInfo> = state
        .pool
        .config()
        .models
        .keys()
        .map(|name| ModelInfo {
            id: name.clone(),
            object: "model".to_string(),
            created: 0,
            owned_by: "corral".to_string(),
            status: status.models.get(name).copied().unwrap_or_default(),
        })
        .collect();
    data.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

/// Chat completion endpoint
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let model = request.model.clone();
    let engine_request = build_chat_request(&request);
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();
    let cancel = CancellationToken::new();

    if request.stream {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let on_chunk: ChunkCallback = Box::new(move |_tokens, text| {
            let _ = tx.send(text.to_string());
        });
        let pool = Arc::clone(&state.pool);
        let task_model = model.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            pool.chat(&task_model, engine_request, Some(on_chunk), task_cancel)
                .await
        });

        let stream = async_stream::stream! {
            let _guard = AbortOnDrop(cancel);
            let role_chunk = ChatStreamChunk::new(&id, &model, created, ChatStreamDelta {
                role: Some("assistant".to_string()),
                content: None,
                tool_calls: None,
            });
            yield serde_json::to_string(&role_chunk).unwrap_or_default();

            while let Some(text) = rx.recv().await {
                let chunk = ChatStreamChunk::new(&id, &model, created, ChatStreamDelta {
                    role: None,
                    content: Some(text),
                    tool_calls: None,
                });
                yield serde_json::to_string(&chunk).unwrap_or_default();
            }

            let mut final_chunk = ChatStreamChunk::new(&id, &model, created, ChatStreamDelta {
                role: None,
                content: None,
                tool_calls: None,
            });
            match handle.await {
                Ok(Ok(result)) => {
                    if !result.function_calls.is_empty() {
                        final_chunk.choices[0].delta.tool_calls =
                            Some(tool_calls_body(&result.function_calls));
                    }
                    final_chunk.choices[0].finish_reason =
                        Some(finish_reason_str(result.finish_reason));
                    final_chunk.usage = Some(result.usage.into());
                }
                Ok(Err(_)) | Err(_) => {
                    final_chunk.choices[0].finish_reason = Some("error");
                }
            }
            yield serde_json::to_string(&final_chunk).unwrap_or_default();
        };
        return sse_response(stream).into_response();
    }

    // Non-streaming response
    let pool = Arc::clone(&state.pool);
    let _guard = AbortOnDrop(cancel.clone());
    let task_model = model.clone();
    let handle =
        tokio::spawn(async move { pool.chat(&task_model, engine_request, None, cancel).await });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::Runtime(format!("request task failed: {e}"))),
    };

    match result {
        Ok(result) => {
            let message = if result.function_calls.is_empty() {
                ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(result.content),
                    tool_calls: None,
                }
            } else {
                ResponseMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: Some(tool_calls_body(&result.function_calls)),
                }
            };
            Json(ChatCompletionResponse {
                id,
                object: "chat.completion".to_string(),
                created,
                model,
                choices: vec![ChatChoice {
                    index: 0,
                    message,
                    finish_reason: finish_reason_str(result.finish_reason).to_string(),
                }],
                usage: result.usage.into(),
            })
            .into_response()
        }
        Err(e) => ServerError(e).into_response(),
    }
}

/// Text completion endpoint
pub async fn completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TextCompletionRequest>,
) -> Response {
    let model = request.model.clone();
    let engine_request = CompletionRequest {
        prompt: request.prompt.clone(),
        sampling: SamplingOverrides {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            seed: request.seed,
            stop_sequences: request.stop.clone(),
            ..Default::default()
        },
        cpu_threads: None,
        batch_size: None,
    };
    let id = format!("cmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();
    let cancel = CancellationToken::new();

    if request.stream {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let on_chunk: ChunkCallback = Box::new(move |_tokens, text| {
            let _ = tx.send(text.to_string());
        });
        let pool = Arc::clone(&state.pool);
        let task_model = model.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            pool.completion(&task_model, engine_request, Some(on_chunk), task_cancel)
                .await
        });

        let stream = async_stream::stream! {
            let _guard = AbortOnDrop(cancel);
            while let Some(text) = rx.recv().await {
                let chunk = StreamCompletionChunk {
                    id: id.clone(),
                    object: "text_completion.chunk".to_string(),
                    created,
                    model: model.clone(),
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: StreamDelta { text },
                        finish_reason: None,
                    }],
                    usage: None,
                };
                yield serde_json::to_string(&chunk).unwrap_or_default();
            }
            let (reason, usage) = match handle.await {
                Ok(Ok(result)) => (finish_reason_str(result.finish_reason), Some(result.usage.into())),
                Ok(Err(_)) | Err(_) => ("error", None),
            };
            let final_chunk = StreamCompletionChunk {
                id: id.clone(),
                object: "text_completion.chunk".to_string(),
                created,
                model: model.clone(),
                choices: vec![StreamChoice {
                    index: 0,
                    delta: StreamDelta { text: String::new() },
                    finish_reason: Some(reason),
                }],
                usage,
            };
            yield serde_json::to_string(&final_chunk).unwrap_or_default();
        };
        return sse_response(stream).into_response();
    }

    let pool = Arc::clone(&state.pool);
    let _guard = AbortOnDrop(cancel.clone());
    let task_model = model.clone();
    let handle = tokio::spawn(async move {
        pool.completion(&task_model, engine_request, None, cancel).await
    });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::Runtime(format!("request task failed: {e}"))),
    };

    match result {
        Ok(result) => Json(TextCompletionResponse {
            id,
            object: "text_completion".to_string(),
            created,
            model,
            choices: vec![CompletionChoice {
                text: result.text,
                index: 0,
                finish_reason: finish_reason_str(result.finish_reason).to_string(),
            }],
            usage: result.usage.into(),
        })
        .into_response(),
        Err(e) => ServerError(e).into_response(),
    }
}

/// Embeddings endpoint
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Response {
    let inputs = match request.input {
        Value::Array(items) => items,
        other => vec![other],
    };
    let engine_request = EmbeddingRequest { inputs };
    let model = request.model.clone();
    let cancel = CancellationToken::new();
    let _guard = AbortOnDrop(cancel.clone());

    let pool = Arc::clone(&state.pool);
    let task_model = model.clone();
    let handle = tokio::spawn(async move {
        pool.embeddings(&task_model, engine_request, cancel).await
    });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::Runtime(format!("request task failed: {e}"))),
    };

    match result {
        Ok(result) => Json(EmbeddingsResponse {
            object: "list".to_string(),
            data: result
                .vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingBody {
                    object: "embedding".to_string(),
                    index,
                    embedding,
                })
                .collect(),
            model,
            usage: result.usage.into(),
        })
        .into_response(),
        Err(e) => ServerError(e).into_response(),
    }
}

/// Translate the wire request into a pool request.
fn build_chat_request(request: &ChatCompletionRequest) -> ChatRequest {
    let mut functions = HashMap::new();
    for tool in &request.tools {
        if tool.r#type != "function" {
            continue;
        }
        functions.insert(
            tool.function.name.clone(),
            FunctionDef {
                description: tool.function.description.clone().unwrap_or_default(),
                parameters: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                handler: None,
            },
        );
    }
    let token_bias = request
        .logit_bias
        .iter()
        .filter_map(|(token, bias)| token.parse().ok().map(|t| (t, *bias)))
        .collect();
    ChatRequest {
        messages: request.messages.clone(),
        sampling: SamplingOverrides {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            min_p: request.min_p,
            seed: request.seed,
            ..Default::default()
        },
        grammar: request.grammar.clone(),
        functions,
        stop_triggers: request.stop.clone().unwrap_or_default(),
        token_bias,
        reset_context: request.reset_context,
    }
}

fn tool_calls_body(calls: &[SurfacedCall]) -> Value {
    Value::Array(
        calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.parameters.to_string(),
                    }
                })
            })
            .collect(),
    )
}

// Request/Response types

#[derive(Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Vec<ToolBody>,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub logit_bias: HashMap<String, f32>,
    #[serde(default)]
    pub reset_context: bool,
}

#[derive(Deserialize)]
pub struct ToolBody {
    pub r#type: String,
    pub function: ToolFunctionBody,
}

#[derive(Deserialize)]
pub struct ToolFunctionBody {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: UsageBody,
}

#[derive(Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Serialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

#[derive(Deserialize)]
pub struct TextCompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct TextCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: UsageBody,
}

#[derive(Serialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: usize,
    pub finish_reason: String,
}

#[derive(Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Value,
}

#[derive(Serialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<EmbeddingBody>,
    pub model: String,
    pub usage: UsageBody,
}

#[derive(Serialize)]
pub struct EmbeddingBody {
    pub object: String,
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub status: crate::engine::ModelStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_declarations_become_request_functions() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "getWeather",
                    "description": "Weather lookup",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }],
            "logit_bias": {"42": 1.5, "not-a-token": 2.0}
        });
        let request: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        let engine_request = build_chat_request(&request);

        assert!(engine_request.functions.contains_key("getWeather"));
        assert!(engine_request.functions["getWeather"].handler.is_none());
        assert_eq!(engine_request.token_bias.get(&42), Some(&1.5));
        assert_eq!(engine_request.token_bias.len(), 1);
    }

    #[test]
    fn assistant_message_with_null_content_parses() {
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": null, "tool_calls": []},
                {"role": "tool", "content": "42", "tool_call_id": "call_1", "name": "f"}
            ]
        });
        let request: ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.messages.len(), 3);
        assert!(matches!(
            &request.messages[2],
            ChatMessage::Function { call_id, .. } if call_id == "call_1"
        ));
    }

    #[test]
    fn surfaced_calls_serialize_in_openai_shape() {
        let calls = vec![SurfacedCall {
            id: "call_abc".to_string(),
            name: "getWeather".to_string(),
            parameters: json!({"city": "Oslo"}),
        }];
        let body = tool_calls_body(&calls);
        assert_eq!(body[0]["type"], "function");
        assert_eq!(body[0]["function"]["name"], "getWeather");
        let arguments: Value =
            serde_json::from_str(body[0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments["city"], "Oslo");
    }
}
