//! ARM2 Emulator Session Daemon (arm2d)
//!
//! Standalone service that:
//! - Owns the process-wide session registry (one VM per debugging session)
//! - Exposes the REST API and per-session WebSocket events of §6
//! - Reaps sessions idle past the configured inactivity timeout
//!
//! Default bind: 127.0.0.1:8871
//! WebSocket: /api/v1/sessions/{id}/events
//! REST API: /api/v1/*

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use arm2d::config::DaemonConfig;
use arm2d::registry::SessionRegistry;
use arm2d::{api, tracing_layer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_layer::init();

    info!("Starting ARM2 emulator session daemon (arm2d)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::from_env();
    let bind_addr: SocketAddr = config.bind_addr.parse()?;
    let registry = Arc::new(SessionRegistry::new(config));

    tokio::spawn(Arc::clone(&registry).reap_idle_forever());

    let app = api::create_router(Arc::clone(&registry));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("arm2d listening on http://{}", bind_addr);
    info!("Swagger UI: http://{}/swagger-ui", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
