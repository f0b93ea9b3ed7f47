use anyhow::{Context, Result};
use chat_router::config::{Cli, RouterConfig};
use chat_router::registry::RoutingRegistry;
use chat_router::routes;
use chat_router::telemetry::init_tracing;
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RouterConfig::try_from(Cli::parse())?;
    init_tracing(&config.log_filter)?;

    let registry = RoutingRegistry::new();
    let app = routes::router(registry);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(addr = %config.listen_addr, "chat-router listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("chat-router stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
