//! HTTP server command

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config::GatewayConfig;
use crate::engine::Pool;
use crate::server;

/// Start the gateway server from a loaded config.
///
/// Requires a runtime backend installed via
/// [`crate::runtime::install_backend`]; the gateway itself ships no
/// inference engine.
pub async fn serve(config: GatewayConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let backend = crate::runtime::installed_backend().ok_or_else(|| {
        anyhow!(
            "no inference backend installed; register one with \
             corral::runtime::install_backend before serving"
        )
    })?;

    let mut server_config = config.server.clone().unwrap_or_default();
    if let Some(host) = host {
        server_config.host = host;
    }
    if let Some(port) = port {
        server_config.port = port;
    }

    tracing::info!(
        models = config.models.len(),
        concurrency = config.concurrency,
        "starting gateway"
    );

    let pool = Arc::new(Pool::new(config, backend));
    server::start(pool, server_config).await
}
