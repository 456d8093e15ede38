//! Corral - local LLM inference gateway
//!
//! Corral fronts one or more on-disk model weight files and serves
//! chat-completion, text-completion, and embedding requests over an
//! OpenAI-compatible HTTP API. Named model configurations are multiplexed
//! onto a bounded pool of long-lived instances; requests are queued,
//! routed, and where possible served by an instance that already holds
//! warm state for the caller's prior turns.
//!
//! # Architecture
//!
//! Corral follows a thin-gateway design:
//! - **runtime adapter**: all tensor math, tokenization, and GPU work is
//!   behind the [`runtime::RuntimeBackend`] trait; backends plug in
//!   without gateway changes
//! - **corral**: pool and dispatch, the chat turn engine (interleaved
//!   host-side function calls), weight downloads, HTTP API, CLI
//!
//! # Example
//!
//! ```bash
//! # Download configured weights
//! corral pull --config gateway.yaml
//!
//! # Start the gateway (with a backend installed by the embedding binary)
//! corral serve --config gateway.yaml --port 8080
//!
//! # Inspect configured models
//! corral list --config gateway.yaml
//! ```

pub mod chat;
pub mod cli;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod server;

// Re-export key types
pub use config::{GatewayConfig, ModelConfig, SamplingConfig, SamplingOverrides};
pub use engine::{
    ChatRequest, ChatResult, CompletionRequest, CompletionResult, EmbeddingRequest,
    EmbeddingResult, FinishReason, Pool, PoolStatus,
};
pub use error::{GatewayError, Result};
