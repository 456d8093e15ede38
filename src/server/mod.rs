//! HTTP server for the gateway
//!
//! Provides an OpenAI-compatible REST API in front of the pool.

mod handlers;
mod routes;
mod streaming;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::engine::Pool;

pub use handlers::AppState;
pub use routes::api_routes;

/// Start the HTTP gateway server. Runs until ctrl-c, then drains the
/// pool before returning.
pub async fn start(pool: Arc<Pool>, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(Arc::clone(&pool)));

    let mut app = Router::new().merge(api_routes()).with_state(state);
    if config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }
    if config.request_logging {
        app = app.layer(TraceLayer::new_for_http());
    }

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET  /health - Health check");
    tracing::info!("  GET  /v1/models - List models and pool status");
    tracing::info!("  POST /v1/completions - Text completion");
    tracing::info!("  POST /v1/chat/completions - Chat completion");
    tracing::info!("  POST /v1/embeddings - Embeddings");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("draining instance pool");
    pool.dispose().await;

    Ok(())
}

/// Wait for SIGINT (Ctrl+C) to trigger graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    tracing::info!("shutdown signal received, draining connections");
}
