use std::sync::Arc;

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chat_core::ChatMessage;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::hub::SessionSummary;
use crate::session::ClientSession;
use crate::state::AppState;

pub const MAX_MESSAGE_SIZE: usize = 512;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 500;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/history", get(history_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };
        (
            status,
            Json(ApiErrorBody {
                error,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    username: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ConnectQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let username = match query.username {
        Some(name) if !name.is_empty() => name,
        _ => {
            warn!("websocket connect without username");
            return Err(ApiError::BadRequest("username is required".into()));
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let session = ClientSession::new(username.clone(), state.host(), state.session_config.clone());
    info!(session_id = %session.id(), %username, "upgrading websocket");
    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_socket(socket, session))
        .into_response())
}

async fn serve_socket(socket: WebSocket, session: ClientSession) {
    let (sink, stream) = socket.split();
    session.run(sink, stream).await;
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let mut messages = state.node.store().recent(limit).await.map_err(|err| {
        warn!(error = %err, "failed to load history");
        ApiError::Internal("failed to load history".into())
    })?;
    messages.reverse();
    Ok(Json(messages))
}

#[derive(Debug, Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    address: &'a str,
    load: usize,
    bus: &'a str,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bridge_up = state.node.bridge().is_up();
    let (status, label) = if bridge_up {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            address: state.address(),
            load: state.node.hub().current_load(),
            bus: state.node.bridge().channel(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    address: String,
    active_sessions: usize,
    bridge_up: bool,
    sessions: Vec<SessionSummary>,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let sessions = state
        .node
        .hub()
        .sessions()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(StatsResponse {
        address: state.address().to_string(),
        active_sessions: sessions.len(),
        bridge_up: state.node.bridge().is_up(),
        sessions,
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
