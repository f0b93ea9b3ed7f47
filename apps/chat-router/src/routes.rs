use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chat_core::LoadReport;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::registry::{ReportOutcome, RoutingError, RoutingRegistry};

pub fn router(registry: RoutingRegistry) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/register", post(register_server))
        .route("/update", post(update_server))
        .route("/get", get(select_server))
        .route("/servers", get(list_servers))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(RoutingError),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(message),
                }),
            )
                .into_response(),
            ApiError::Unavailable(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiErrorBody {
                    error: "no_servers_available",
                    message: Some(err.to_string()),
                }),
            )
                .into_response(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("invalid load report: {err}"))
    }
}

/// Decodes a report regardless of content type; only bodies that are not a
/// valid report are rejected.
fn decode_report(body: &[u8], action: &'static str) -> Result<LoadReport, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        warn!(action, error = %err, "rejected load report body");
        ApiError::from(err)
    })
}

impl From<RoutingError> for ApiError {
    fn from(err: RoutingError) -> Self {
        ApiError::Unavailable(err)
    }
}

async fn register_server(
    State(registry): State<RoutingRegistry>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let report = decode_report(&body, "register")?;
    let address = report.address.clone();
    let load = report.load;
    registry.report_load(report);
    info!(%address, load, "server registered");
    Ok(StatusCode::OK)
}

async fn update_server(
    State(registry): State<RoutingRegistry>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let report = decode_report(&body, "update")?;
    let address = report.address.clone();
    let load = report.load;
    match registry.report_load(report) {
        ReportOutcome::Updated { previous } => {
            debug!(%address, previous, load, "load updated");
        }
        ReportOutcome::Inserted => {
            info!(%address, load, "server auto-registered from load update");
        }
    }
    Ok(StatusCode::OK)
}

async fn select_server(
    State(registry): State<RoutingRegistry>,
) -> Result<Json<LoadReport>, ApiError> {
    match registry.select_best() {
        Ok(best) => {
            debug!(address = %best.address, load = best.load, "selected server");
            Ok(Json(best))
        }
        Err(err) => {
            warn!("selection requested with no registered servers");
            Err(err.into())
        }
    }
}

async fn list_servers(State(registry): State<RoutingRegistry>) -> Json<Vec<LoadReport>> {
    Json(registry.snapshot())
}
