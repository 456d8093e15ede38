//! Chat messages and canonical history
//!
//! Two representations exist. [`ChatMessage`] is the wire-level form the
//! HTTP adapters and config preloads use. [`HistoryItem`] is the canonical
//! form handed to the runtime: a flat list of system/user/model items where
//! a model item is a sequence of text and resolved-function-call segments.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire-level chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        /// Null on the wire when the message only carried function calls
        #[serde(default, deserialize_with = "null_as_empty")]
        content: String,
    },
    /// The result of a previously surfaced function call, identified by
    /// the opaque id the gateway handed out.
    #[serde(alias = "tool")]
    Function {
        content: String,
        #[serde(alias = "tool_call_id")]
        call_id: String,
        name: String,
    },
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: content.into(),
        }
    }
}

/// One item of canonical chat history.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryItem {
    System(String),
    User(String),
    Model(Vec<ResponseSegment>),
}

impl HistoryItem {
    /// Concatenation of the text segments of a model item; empty for
    /// system/user items.
    pub fn model_text(&self) -> String {
        match self {
            HistoryItem::Model(segments) => segments
                .iter()
                .filter_map(|s| match s {
                    ResponseSegment::Text(t) => Some(t.as_str()),
                    ResponseSegment::FunctionCall(_) => None,
                })
                .collect(),
            _ => String::new(),
        }
    }
}

/// A segment of a model response: literal text, or a function call that
/// has been resolved to a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSegment {
    Text(String),
    FunctionCall(FunctionCallSegment),
}

/// A resolved function call as it appears inside a model history item.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallSegment {
    pub name: String,
    pub description: Option<String>,
    pub params: Value,
    pub result: Value,
    /// The call rendered in the model's native function-call syntax, as
    /// produced by the runtime's chat wrapper.
    pub raw: String,
}

/// Build canonical history from wire messages.
///
/// System messages are merged into at most one leading item, joined with a
/// blank line. Function messages are not representable without the pending
/// call that produced them and are skipped here; the turn engine splices
/// them against the instance's pending-call table before assembly.
pub fn assemble_history(messages: &[ChatMessage]) -> Vec<HistoryItem> {
    let mut system_text = String::new();
    let mut items = Vec::new();

    for message in messages {
        match message {
            ChatMessage::System { content } => {
                if !system_text.is_empty() {
                    system_text.push_str("\n\n");
                }
                system_text.push_str(content);
            }
            ChatMessage::User { content } => items.push(HistoryItem::User(content.clone())),
            ChatMessage::Assistant { content } => {
                items.push(HistoryItem::Model(vec![ResponseSegment::Text(
                    content.clone(),
                )]))
            }
            ChatMessage::Function { .. } => {}
        }
    }

    if !system_text.is_empty() {
        items.insert(0, HistoryItem::System(system_text));
    }

    items
}

/// Append an empty model item if the history does not already end with a
/// model item. Generation writes into the trailing model item.
pub fn ensure_trailing_model_item(history: &mut Vec<HistoryItem>) {
    if !matches!(history.last(), Some(HistoryItem::Model(_))) {
        history.push(HistoryItem::Model(Vec::new()));
    }
}

/// Length (in items) of the longest common prefix between an instance's
/// history and a request's messages, used for affinity routing.
///
/// Model items compare on their text content only; resolved function-call
/// segments inside them do not break the match.
pub fn common_prefix_len(history: &[HistoryItem], messages: &[ChatMessage]) -> usize {
    let incoming = assemble_history(messages);
    history
        .iter()
        .zip(incoming.iter())
        .take_while(|(held, wanted)| match (held, wanted) {
            (HistoryItem::System(a), HistoryItem::System(b)) => a == b,
            (HistoryItem::User(a), HistoryItem::User(b)) => a == b,
            (a @ HistoryItem::Model(_), b @ HistoryItem::Model(_)) => {
                a.model_text() == b.model_text()
            }
            _ => false,
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_system_messages_merge_with_blank_line() {
        let history = assemble_history(&[
            ChatMessage::system("Be brief."),
            ChatMessage::system("Answer in English."),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(
            history[0],
            HistoryItem::System("Be brief.\n\nAnswer in English.".into())
        );
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn at_most_one_leading_system_item() {
        let history = assemble_history(&[
            ChatMessage::user("hi"),
            ChatMessage::system("late system"),
            ChatMessage::user("again"),
        ]);
        let system_count = history
            .iter()
            .filter(|i| matches!(i, HistoryItem::System(_)))
            .count();
        assert_eq!(system_count, 1);
        assert!(matches!(history[0], HistoryItem::System(_)));
    }

    #[test]
    fn trailing_model_item_appended_once() {
        let mut history = vec![HistoryItem::User("hi".into())];
        ensure_trailing_model_item(&mut history);
        ensure_trailing_model_item(&mut history);
        assert_eq!(history.len(), 2);
        assert!(matches!(history[1], HistoryItem::Model(_)));
    }

    #[test]
    fn prefix_length_counts_matching_items() {
        let held = vec![
            HistoryItem::User("a".into()),
            HistoryItem::Model(vec![ResponseSegment::Text("b".into())]),
            HistoryItem::User("c".into()),
        ];
        let messages = [
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::user("different"),
        ];
        assert_eq!(common_prefix_len(&held, &messages), 2);
    }

    #[test]
    fn function_call_segments_do_not_break_prefix_match() {
        let held = vec![
            HistoryItem::User("a".into()),
            HistoryItem::Model(vec![
                ResponseSegment::FunctionCall(FunctionCallSegment {
                    name: "lookup".into(),
                    description: None,
                    params: serde_json::json!({}),
                    result: serde_json::json!("x"),
                    raw: String::new(),
                }),
                ResponseSegment::Text("answer".into()),
            ]),
        ];
        let messages = [ChatMessage::user("a"), ChatMessage::assistant("answer")];
        assert_eq!(common_prefix_len(&held, &messages), 2);
    }

    #[test]
    fn message_roles_round_trip_through_serde() {
        let json = r#"[
            {"role": "system", "content": "s"},
            {"role": "user", "content": "u"},
            {"role": "function", "content": "42", "call_id": "c1", "name": "f"}
        ]"#;
        let messages: Vec<ChatMessage> = serde_json::from_str(json).unwrap();
        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[2], ChatMessage::Function { call_id, name, .. }
            if call_id == "c1" && name == "f"));
    }
}
