//! Function definitions and call bookkeeping
//!
//! A function with a host-side handler is *evocable*: the turn engine can
//! resolve it within the current request. One without a handler must be
//! surfaced to the caller and resolved through a follow-up request.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::runtime::{EmittedFunctionCall, FunctionDeclaration};

/// The future a handler returns: a JSON result or a failure message.
pub type HandlerFuture = BoxFuture<'static, std::result::Result<Value, String>>;

/// A host-side callable resolving a function call.
pub type FunctionHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A function the model may call.
#[derive(Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    #[serde(default)]
    pub description: String,

    /// JSON-schema description of the parameters
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,

    /// Host-side handler. Never serialized; registered programmatically.
    #[serde(skip)]
    pub handler: Option<FunctionHandler>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .field("handler", &self.handler.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl FunctionDef {
    pub fn new(description: impl Into<String>) -> Self {
        FunctionDef {
            description: description.into(),
            parameters: empty_object_schema(),
            handler: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Whether the turn engine can resolve calls to this function
    /// host-side.
    pub fn is_evocable(&self) -> bool {
        self.handler.is_some()
    }
}

/// Merge model-config functions with request functions; request wins by
/// name.
pub fn effective_functions(
    model: &HashMap<String, FunctionDef>,
    request: &HashMap<String, FunctionDef>,
) -> HashMap<String, FunctionDef> {
    let mut merged = model.clone();
    for (name, def) in request {
        merged.insert(name.clone(), def.clone());
    }
    merged
}

/// Flatten a function set into the declarations the runtime prompts with.
pub fn declarations(functions: &HashMap<String, FunctionDef>) -> Vec<FunctionDeclaration> {
    let mut declarations: Vec<FunctionDeclaration> = functions
        .iter()
        .map(|(name, def)| FunctionDeclaration {
            name: name.clone(),
            description: def.description.clone(),
            parameters: def.parameters.clone(),
        })
        .collect();
    declarations.sort_by(|a, b| a.name.cmp(&b.name));
    declarations
}

/// Split emitted calls into the leading run the engine executes host-side
/// and the remainder it surfaces to the caller.
///
/// The prefix is the longest leading subsequence of evocable calls; the
/// first call without a handler and everything after it (evocable or not)
/// belongs to the remainder, in emission order. A call naming an
/// undefined function is fatal to the request.
pub fn split_evocable_prefix<'a>(
    calls: &'a [EmittedFunctionCall],
    functions: &HashMap<String, FunctionDef>,
) -> Result<(&'a [EmittedFunctionCall], &'a [EmittedFunctionCall]), GatewayError> {
    for call in calls {
        if !functions.contains_key(&call.name) {
            return Err(GatewayError::UndefinedFunction(call.name.clone()));
        }
    }
    let split = calls
        .iter()
        .position(|call| !functions[&call.name].is_evocable())
        .unwrap_or(calls.len());
    Ok(calls.split_at(split))
}

/// A surfaced call awaiting a function-result message in a later request.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub name: String,
    pub params: Value,
}

/// A call surfaced to the caller in an assistant message.
#[derive(Debug, Clone, Serialize)]
pub struct SurfacedCall {
    pub id: String,
    pub name: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str) -> EmittedFunctionCall {
        EmittedFunctionCall {
            name: name.to_string(),
            params: json!({}),
            raw: String::new(),
        }
    }

    fn evocable() -> FunctionDef {
        FunctionDef::new("e").with_handler(|_| Box::pin(async { Ok(json!(null)) }))
    }

    #[test]
    fn prefix_stops_at_first_non_evocable() {
        let mut functions = HashMap::new();
        functions.insert("a".to_string(), evocable());
        functions.insert("b".to_string(), FunctionDef::new("no handler"));

        let calls = [call("a"), call("a"), call("b"), call("a")];
        let (prefix, remainder) = split_evocable_prefix(&calls, &functions).unwrap();
        assert_eq!(prefix.len(), 2);
        assert_eq!(remainder.len(), 2);
        assert_eq!(remainder[0].name, "b");
        assert_eq!(remainder[1].name, "a");
    }

    #[test]
    fn all_evocable_means_empty_remainder() {
        let mut functions = HashMap::new();
        functions.insert("a".to_string(), evocable());

        let calls = [call("a"), call("a")];
        let (prefix, remainder) = split_evocable_prefix(&calls, &functions).unwrap();
        assert_eq!(prefix.len(), 2);
        assert!(remainder.is_empty());
    }

    #[test]
    fn undefined_function_is_fatal() {
        let functions = HashMap::new();
        let calls = [call("ghost")];
        let err = split_evocable_prefix(&calls, &functions).unwrap_err();
        assert!(matches!(err, GatewayError::UndefinedFunction(name) if name == "ghost"));
    }

    #[test]
    fn request_functions_override_model_functions_by_name() {
        let mut model = HashMap::new();
        model.insert("f".to_string(), FunctionDef::new("model-side"));
        let mut request = HashMap::new();
        request.insert("f".to_string(), FunctionDef::new("request-side"));

        let merged = effective_functions(&model, &request);
        assert_eq!(merged["f"].description, "request-side");
    }

    #[test]
    fn handler_is_not_serialized() {
        let def = evocable();
        let json = serde_json::to_string(&def).unwrap();
        assert!(!json.contains("handler"));
        let back: FunctionDef = serde_json::from_str(&json).unwrap();
        assert!(back.handler.is_none());
    }
}
