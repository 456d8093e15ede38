//! Gateway error types
//!
//! Every failure the pool can surface falls into one of a small set of
//! kinds so that callers (HTTP handlers, embedding applications) can map
//! them without string-matching.

use thiserror::Error;

/// Result alias used throughout the gateway core.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Top-level error type for pool, instance, and turn-engine operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad configuration: unknown model name, unknown grammar name, etc.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or unobtainable resources: absent weight file with no URL,
    /// failed download, context creation failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// The underlying runtime failed mid-operation.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The runtime reported the instance's context unusable. The pool
    /// disposes the instance and empties its slot.
    #[error("context unusable: {0}")]
    ContextUnusable(String),

    /// The model invoked a function that was never defined. Fatal to the
    /// request that triggered it.
    #[error("model called undefined function '{0}'")]
    UndefinedFunction(String),

    /// The caller aborted the request. Not an error to the pool itself.
    #[error("request aborted")]
    Cancelled,

    /// The pool is draining; queued requests fail with this code.
    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Whether this failure should evict the instance that produced it.
    ///
    /// Only a context reported unusable by the adapter warrants disposal;
    /// everything else returns the instance to the pool.
    pub fn is_fatal_to_instance(&self) -> bool {
        matches!(self, GatewayError::ContextUnusable(_))
    }
}

impl From<crate::runtime::RuntimeError> for GatewayError {
    fn from(err: crate::runtime::RuntimeError) -> Self {
        match err {
            crate::runtime::RuntimeError::Aborted => GatewayError::Cancelled,
            crate::runtime::RuntimeError::ContextUnusable(msg) => {
                GatewayError::ContextUnusable(msg)
            }
            other => GatewayError::Runtime(other.to_string()),
        }
    }
}
