//! `fluxdm-server`: the production `Transport` for the download engine — a
//! WebSocket endpoint (axum) driving a process-wide `Registry`.

mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use engine::{EngineConfig, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(EngineConfig::default());
    let client = engine::build_client(&config)?;
    let registry = Arc::new(Registry::from_config(&config));

    let state = ws::AppState { registry, config, client };
    let app = Router::new().route("/ws", get(ws::handler)).with_state(state);

    let addr: SocketAddr = std::env::var("FLUXDM_LISTEN")
        .unwrap_or_else(|_| "127.0.0.1:7878".to_string())
        .parse()?;

    tracing::info!(%addr, "fluxdm-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
