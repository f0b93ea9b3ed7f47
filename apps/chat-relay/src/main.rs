use std::sync::Arc;

use anyhow::{Context, Result};
use chat_relay::config::{Cli, RelayConfig};
use chat_relay::hub::HubConfig;
use chat_relay::node::ChatNode;
use chat_relay::reporter::{HttpLoadReporter, LoadReporter, NoopLoadReporter, RouterClient};
use chat_relay::routes;
use chat_relay::state::AppState;
use chat_relay::store::{MessageStore, SqliteMessageStore};
use chat_relay::telemetry::Telemetry;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{error, info};
use transport_bus::{Bus, RedisBus};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(&config.telemetry)?;

    info!(
        listen_addr = %config.listen_addr,
        public_address = %config.public_address,
        redis_url = %config.redis_url,
        router_url = config.router_url.as_deref().unwrap_or("-"),
        "starting chat-relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let store: Arc<dyn MessageStore> = Arc::new(
        SqliteMessageStore::connect(&config.database_url)
            .await
            .context("failed to open message store")?,
    );
    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&config.redis_url)
            .await
            .context("failed to connect to redis")?,
    );

    let (reporter, reporter_task) = match &config.router_url {
        Some(url) => {
            let client = RouterClient::new(url.clone());
            client
                .register_with_retry(
                    &config.public_address,
                    config.register_attempts,
                    config.register_backoff,
                )
                .await
                .context("failed to register with router")?;
            let (reporter, task) = HttpLoadReporter::spawn(client, config.public_address.clone());
            let reporter: Arc<dyn LoadReporter> = reporter;
            (reporter, Some(task))
        }
        None => {
            info!("no router configured; load reports disabled");
            let reporter: Arc<dyn LoadReporter> = Arc::new(NoopLoadReporter);
            (reporter, None)
        }
    };

    let (node, tasks) = ChatNode::start(
        config.public_address.clone(),
        bus,
        config.bus_channel.clone(),
        store,
        reporter,
        HubConfig::default(),
    )
    .await
    .context("failed to start bus bridge")?;

    let bridge_abort = tasks.bridge.abort_handle();
    let bridge_watch = tasks.bridge;
    let bridge_monitor = tokio::spawn(async move {
        match bridge_watch.await {
            Ok(reason) => error!(error = %reason, "serving local clients only"),
            Err(err) if err.is_cancelled() => {}
            Err(err) => error!(error = %err, "bus bridge task panicked"),
        }
    });

    let state = AppState::with_metrics(node, config.session.clone(), metrics);
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("chat-relay listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    bridge_abort.abort();
    bridge_monitor.abort();
    tasks.dispatch.abort();
    if let Some(task) = reporter_task {
        task.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
