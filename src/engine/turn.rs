//! Chat turn engine
//!
//! Executes one API-level chat request. A single request may take several
//! generation rounds: when the model emits function calls the engine can
//! resolve host-side, their results are spliced into history and the model
//! generates again, all inside the same request.
//!
//! The round structure is an explicit state machine:
//!
//! ```text
//! Generating ──(no calls)──────────────► Done
//!     │ ▲
//!     │ └──(prefix resolved, nothing left to surface)
//!     ▼
//! ResolvingCalls ──(remainder present)─► SurfacingCalls ─► Done
//! ```

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chat::{
    assemble_history, ensure_trailing_model_item, common_prefix_len, ChatMessage,
    FunctionCallSegment, HistoryItem, ResponseSegment,
};
use crate::config::SamplingConfig;
use crate::engine::functions::{
    declarations, effective_functions, split_evocable_prefix, FunctionDef, PendingCall,
    SurfacedCall,
};
use crate::engine::{ChatRequest, ChatResult, ChunkCallback, FinishReason, Instance, TokenUsage};
use crate::error::{GatewayError, Result};
use crate::runtime::{
    EmittedFunctionCall, GenerateConstraint, GenerateRequest, LastEvaluation, RuntimeError,
    RuntimeStopReason, TokenId,
};

/// Overlap hint below which the runtime shifts context instead of reusing
/// the prefix cache.
const MIN_OVERLAP_RATIO: f32 = 0.5;

/// Upper bound on calls the model may emit in one round.
const MAX_PARALLEL_FUNCTION_CALLS: usize = 2;

enum TurnState {
    Generating,
    ResolvingCalls {
        prefix: Vec<EmittedFunctionCall>,
        remainder: Vec<EmittedFunctionCall>,
    },
    SurfacingCalls(Vec<EmittedFunctionCall>),
    Done(FinishReason),
}

/// Run one chat request to completion against a leased instance.
pub(crate) async fn run_chat_turn(
    instance: &mut Instance,
    request: &ChatRequest,
    mut on_chunk: Option<ChunkCallback>,
    cancel: &CancellationToken,
) -> Result<ChatResult> {
    // Grammar wins over functions when both are supplied; a grammar name
    // that was never compiled into the instance is a configuration error
    // regardless.
    let grammar = match &request.grammar {
        Some(name) => Some(instance.grammar(name)?),
        None => None,
    };
    let functions = if grammar.is_some() {
        Default::default()
    } else {
        effective_functions(&instance.config().functions, &request.functions)
    };

    if request.reset_context
        || (!instance.chat_history.is_empty()
            && common_prefix_len(&instance.chat_history, &request.messages) == 0)
    {
        instance.reset_chat(cancel).await?;
    }

    let mut working_history = instance.chat_history.clone();
    let mut last_evaluation: Option<LastEvaluation> = instance.last_evaluation.clone();
    assemble_turn_history(instance, &request.messages, &mut working_history, &functions);
    ensure_trailing_model_item(&mut working_history);

    let sampling = request.sampling.apply(&SamplingConfig::default());
    let meter_before = instance.chat_context().token_meter();

    let mut streamed = String::new();
    let mut surfaced: Vec<SurfacedCall> = Vec::new();
    let mut state = TurnState::Generating;

    let finish_reason = loop {
        state = match state {
            TurnState::Generating => {
                let constraint = match &grammar {
                    Some(g) => GenerateConstraint::Grammar(g.clone()),
                    None if !functions.is_empty() => GenerateConstraint::Functions {
                        declarations: declarations(&functions),
                        document_params: true,
                        max_parallel: MAX_PARALLEL_FUNCTION_CALLS,
                    },
                    None => GenerateConstraint::None,
                };

                let mut sink = |tokens: &[TokenId], text: &str| {
                    streamed.push_str(text);
                    if let Some(cb) = on_chunk.as_mut() {
                        cb(tokens, text);
                    }
                };
                let generate = GenerateRequest {
                    history: &working_history,
                    sampling: &sampling,
                    token_bias: &request.token_bias,
                    stop_triggers: &request.stop_triggers,
                    constraint,
                    last_evaluation: last_evaluation.as_ref(),
                    minimum_overlap_ratio: MIN_OVERLAP_RATIO,
                    trim_whitespace_suffix: false,
                    stop_on_abort: true,
                };
                let outcome = match instance
                    .chat_context()
                    .generate_response(generate, &mut sink, cancel)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // A mid-stream failure still surfaces the partial
                        // output; the warm state rolls back to the last
                        // successful turn. An unusable context is flagged
                        // so the pool disposes the instance on release.
                        if matches!(e, RuntimeError::ContextUnusable(_)) {
                            instance.mark_defunct();
                        }
                        instance.restore_clean_history();
                        break match e {
                            RuntimeError::Aborted => FinishReason::Abort,
                            _ => FinishReason::Error,
                        };
                    }
                };

                working_history = outcome.last_evaluation.clean_history.clone();
                last_evaluation = Some(outcome.last_evaluation);

                if outcome.stop_reason == RuntimeStopReason::Abort {
                    // Partial output goes back to the caller; the warm
                    // state rolls back to the last successful turn.
                    instance.restore_clean_history();
                    break FinishReason::Abort;
                }

                if outcome.function_calls.is_empty() {
                    TurnState::Done(FinishReason::from_stop(outcome.stop_reason))
                } else {
                    let (prefix, remainder) =
                        match split_evocable_prefix(&outcome.function_calls, &functions) {
                            Ok(split) => split,
                            Err(e) => {
                                instance.restore_clean_history();
                                return Err(e);
                            }
                        };
                    if prefix.is_empty() {
                        TurnState::SurfacingCalls(remainder.to_vec())
                    } else {
                        TurnState::ResolvingCalls {
                            prefix: prefix.to_vec(),
                            remainder: remainder.to_vec(),
                        }
                    }
                }
            }

            TurnState::ResolvingCalls { prefix, remainder } => {
                if let Err(e) = resolve_calls(
                    instance,
                    &functions,
                    &prefix,
                    &mut working_history,
                    last_evaluation.as_mut(),
                )
                .await
                {
                    instance.restore_clean_history();
                    return Err(e);
                }
                if remainder.is_empty() {
                    TurnState::Generating
                } else {
                    TurnState::SurfacingCalls(remainder)
                }
            }

            TurnState::SurfacingCalls(remainder) => {
                for call in &remainder {
                    let id = format!("call_{}", Uuid::new_v4().simple());
                    instance.pending_function_calls.insert(
                        id.clone(),
                        PendingCall {
                            name: call.name.clone(),
                            params: call.params.clone(),
                        },
                    );
                    surfaced.push(SurfacedCall {
                        id,
                        name: call.name.clone(),
                        parameters: call.params.clone(),
                    });
                }
                TurnState::Done(FinishReason::FunctionCall)
            }

            TurnState::Done(reason) => break reason,
        };
    };

    let meter_after = instance.chat_context().token_meter();
    let usage = TokenUsage {
        prompt_tokens: meter_after.used_input_tokens - meter_before.used_input_tokens,
        completion_tokens: meter_after.used_output_tokens - meter_before.used_output_tokens,
    };

    if matches!(finish_reason, FinishReason::Abort | FinishReason::Error) {
        return Ok(ChatResult {
            content: streamed,
            function_calls: Vec::new(),
            finish_reason,
            usage,
        });
    }

    // Commit the warm state for the next request on this instance.
    let content = if surfaced.is_empty() {
        working_history
            .last()
            .map(HistoryItem::model_text)
            .unwrap_or_default()
    } else {
        String::new()
    };
    instance.chat_history = working_history;
    instance.last_evaluation = last_evaluation;

    Ok(ChatResult {
        content,
        function_calls: surfaced,
        finish_reason,
        usage,
    })
}

/// Splice function-result messages against pending calls and append a
/// trailing user turn, mutating the working history.
///
/// On a fresh (or just reset) instance the full message list is assembled
/// instead; function results have no pending record there and are dropped.
fn assemble_turn_history(
    instance: &mut Instance,
    messages: &[ChatMessage],
    working_history: &mut Vec<HistoryItem>,
    functions: &std::collections::HashMap<String, FunctionDef>,
) {
    if working_history.is_empty() {
        *working_history = assemble_history(messages);
        for message in messages {
            if let ChatMessage::Function { call_id, .. } = message {
                warn!(call_id = %call_id, "function result without a pending call; dropped");
            }
        }
        return;
    }

    for message in messages {
        if let ChatMessage::Function {
            content,
            call_id,
            name,
        } = message
        {
            let Some(pending) = instance.pending_function_calls.remove(call_id) else {
                warn!(call_id = %call_id, "function result without a pending call; dropped");
                continue;
            };
            let result = serde_json::from_str(content)
                .unwrap_or_else(|_| serde_json::Value::String(content.clone()));
            let raw = instance
                .model()
                .render_function_call(&pending.name, &pending.params, &result);
            let segment = ResponseSegment::FunctionCall(FunctionCallSegment {
                description: functions.get(name).map(|d| d.description.clone()),
                name: pending.name,
                params: pending.params,
                result,
                raw,
            });
            append_to_trailing_model_item(working_history, segment);
            debug!(call_id = %call_id, "spliced function result into history");
        }
    }

    if let Some(ChatMessage::User { content }) = messages.last() {
        working_history.push(HistoryItem::User(content.clone()));
    }
}

/// Run the evocable prefix in parallel and splice each result into the
/// working history and the evaluation's context window.
async fn resolve_calls(
    instance: &mut Instance,
    functions: &std::collections::HashMap<String, FunctionDef>,
    prefix: &[EmittedFunctionCall],
    working_history: &mut Vec<HistoryItem>,
    last_evaluation: Option<&mut LastEvaluation>,
) -> Result<()> {
    let handlers = prefix.iter().map(|call| {
        let handler = functions[&call.name]
            .handler
            .clone()
            .expect("evocable prefix implies a handler");
        handler(call.params.clone())
    });
    let results = join_all(handlers).await;

    let mut context_window = last_evaluation.map(|e| &mut e.context_window);
    for (call, result) in prefix.iter().zip(results) {
        let result = result.map_err(|e| {
            GatewayError::Runtime(format!("function '{}' failed: {e}", call.name))
        })?;
        let raw = instance
            .model()
            .render_function_call(&call.name, &call.params, &result);
        let segment = ResponseSegment::FunctionCall(FunctionCallSegment {
            name: call.name.clone(),
            description: functions.get(&call.name).map(|d| d.description.clone()),
            params: call.params.clone(),
            result,
            raw,
        });
        append_to_trailing_model_item(working_history, segment.clone());
        if let Some(window) = context_window.as_mut() {
            append_to_trailing_model_item(window, segment);
        }
    }
    Ok(())
}

fn append_to_trailing_model_item(history: &mut Vec<HistoryItem>, segment: ResponseSegment) {
    ensure_trailing_model_item(history);
    if let Some(HistoryItem::Model(segments)) = history.last_mut() {
        segments.push(segment);
    }
}
