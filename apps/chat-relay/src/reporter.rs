//! Pushes this process's session count to the routing service.

use std::sync::Arc;
use std::time::Duration;

use chat_core::LoadReport;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives the hub's registry size after every change. Must not block.
pub trait LoadReporter: Send + Sync {
    fn report(&self, load: usize);
}

/// Used when the relay runs without a router.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoadReporter;

impl LoadReporter for NoopLoadReporter {
    fn report(&self, _load: usize) {}
}

/// Keeps only the most recent load; readers see coalesced values.
#[derive(Debug)]
pub struct WatchLoadReporter {
    tx: watch::Sender<usize>,
}

impl WatchLoadReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> usize {
        *self.tx.borrow()
    }
}

impl Default for WatchLoadReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadReporter for WatchLoadReporter {
    fn report(&self, load: usize) {
        self.tx.send_replace(load);
    }
}

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// HTTP client for the router's registration API.
#[derive(Clone)]
pub struct RouterClient {
    http: Client,
    base_url: String,
}

impl RouterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, address: &str) -> Result<(), ReporterError> {
        self.post("/register", &LoadReport::registration(address))
            .await
    }

    pub async fn update(&self, address: &str, load: u32) -> Result<(), ReporterError> {
        self.post("/update", &LoadReport::new(address, load)).await
    }

    /// Fixed-backoff registration; returns the last error once attempts run out.
    pub async fn register_with_retry(
        &self,
        address: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Result<(), ReporterError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.register(address).await {
                Ok(()) => {
                    info!(router = %self.base_url, %address, attempt, "registered with router");
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    warn!(
                        router = %self.base_url,
                        %address,
                        attempt,
                        error = %err,
                        "router registration failed; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post(&self, path: &str, report: &LoadReport) -> Result<(), ReporterError> {
        let url = format!("{}{}", self.base_url, path);
        let res = self.http.post(url).json(report).send().await?;
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ReporterError::UnexpectedStatus { status, body })
        }
    }
}

/// Load reporter that forwards coalesced values to the router in the background.
pub struct HttpLoadReporter {
    latest: WatchLoadReporter,
}

impl HttpLoadReporter {
    pub fn spawn(client: RouterClient, address: impl Into<String>) -> (Arc<Self>, JoinHandle<()>) {
        let latest = WatchLoadReporter::new();
        let task = tokio::spawn(sync_loop(client, address.into(), latest.subscribe()));
        (Arc::new(Self { latest }), task)
    }

    pub fn latest(&self) -> usize {
        self.latest.latest()
    }
}

impl LoadReporter for HttpLoadReporter {
    fn report(&self, load: usize) {
        self.latest.report(load);
    }
}

async fn sync_loop(client: RouterClient, address: String, mut rx: watch::Receiver<usize>) {
    while rx.changed().await.is_ok() {
        let load = *rx.borrow_and_update();
        let load = u32::try_from(load).unwrap_or(u32::MAX);
        match client.update(&address, load).await {
            Ok(()) => debug!(router = %client.base_url, %address, load, "load reported"),
            Err(err) => warn!(
                router = %client.base_url,
                %address,
                load,
                error = %err,
                "failed to report load"
            ),
        }
    }
    debug!(%address, "load reporter stopped");
}
