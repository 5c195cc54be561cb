use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;

use pharmaai_backend::config::Settings;
use pharmaai_backend::logging;
use pharmaai_backend::registry::spawn_maintenance;
use pharmaai_backend::server::router::router;
use pharmaai_backend::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    logging::init(&settings.log_dir);

    let state = AppState::initialize(settings).await?;

    let maintenance = spawn_maintenance(
        state.registry.clone(),
        Duration::from_secs(state.settings.websocket.heartbeat_interval_secs),
        Duration::from_secs(state.settings.websocket.connection_timeout_secs),
    );

    let bind_addr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    );
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!("Listening on {}", addr);

    let app: Router = router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    maintenance.abort();
    state.registry.close_all("server shutting down");
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}
