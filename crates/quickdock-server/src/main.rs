//! quickdock backend.
//!
//! Polls the local Docker daemon, pushes state to every connected UI, and
//! bridges container terminals and log tails over WebSocket and SSE.

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use quickdock_core::{Engine, SnapshotBuilder};
use quickdock_engine::{ComposeCli, DockerEngine};
use quickdock_session::{BroadcastHub, ExecBridge, LogTail};
use quickdock_transport::{AppState, router};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_level.as_deref());

    let engine: Arc<dyn Engine> =
        Arc::new(DockerEngine::connect().context("Failed to create Docker client")?);
    match engine.health().await {
        Ok(health) => info!(
            server_version = %health.server_version,
            containers = health.containers,
            "Connected to Docker"
        ),
        Err(e) => warn!(error = %e, "Docker is not reachable yet, retrying every poll"),
    }

    let shutdown = CancellationToken::new();
    let hub = BroadcastHub::new(SnapshotBuilder::new(Arc::clone(&engine)), config.hub());
    let hub_task = hub.spawn(shutdown.child_token());

    let state = AppState::new(
        Arc::clone(&engine),
        Arc::new(ComposeCli::new(config.compose())),
        hub,
        ExecBridge::new(Arc::clone(&engine), config.exec()).with_shutdown(shutdown.clone()),
        LogTail::new(Arc::clone(&engine), config.logs()).with_shutdown(shutdown.clone()),
    );

    let mut app = router(state);
    match &config.frontend_dir {
        Some(dir) if dir.is_dir() => {
            info!(dir = %dir.display(), "Serving frontend");
            app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
        }
        Some(dir) => warn!(dir = %dir.display(), "Frontend directory not found, serving API only"),
        None => {}
    }

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.addr()))?;
    info!("quickdock listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = hub_task.await {
        warn!("Hub task failed: {e}");
    }
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(level: Option<&str>) {
    let filter = level.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        EnvFilter::new,
    );
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

/// Resolves on Ctrl-C and cancels every session so open sockets and streams
/// finish and graceful shutdown can complete.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal, closing sessions...");
    shutdown.cancel();
}
