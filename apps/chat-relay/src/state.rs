use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::node::ChatNode;
use crate::session::{SessionConfig, SessionHost};

pub struct AppState {
    pub node: ChatNode,
    pub session_config: SessionConfig,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(node: ChatNode, session_config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            node,
            session_config,
            metrics: None,
        })
    }

    pub fn with_metrics(
        node: ChatNode,
        session_config: SessionConfig,
        metrics: PrometheusHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            session_config,
            metrics: Some(metrics),
        })
    }

    pub fn address(&self) -> &str {
        self.node.address()
    }

    /// Prometheus text, or an empty body when no recorder is installed.
    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }

    pub fn host(&self) -> Arc<dyn SessionHost> {
        Arc::new(self.node.clone())
    }
}
