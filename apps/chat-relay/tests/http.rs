use std::sync::Arc;
use std::time::Duration;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chat_core::ChatMessage;
use chat_relay::hub::HubConfig;
use chat_relay::node::ChatNode;
use chat_relay::reporter::NoopLoadReporter;
use chat_relay::routes;
use chat_relay::session::SessionConfig;
use chat_relay::state::AppState;
use chat_relay::store::{MessageStore, SqliteMessageStore};
use serde_json::Value;
use tower::util::ServiceExt;
use transport_bus::LocalBus;

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Harness {
    app: Router,
    node: ChatNode,
    bus: Arc<LocalBus>,
}

async fn harness() -> Result<Harness, Box<dyn std::error::Error>> {
    let bus = Arc::new(LocalBus::new());
    let store = Arc::new(SqliteMessageStore::in_memory().await?);
    let (node, _tasks) = ChatNode::start(
        "ws://relay:8080",
        bus.clone(),
        "chat-messages",
        store,
        Arc::new(NoopLoadReporter),
        HubConfig::default(),
    )
    .await?;
    let app = routes::router(AppState::new(node.clone(), SessionConfig::default()));
    Ok(Harness { app, node, bus })
}

async fn get(app: &Router, uri: &str) -> Result<axum::response::Response, Box<dyn std::error::Error>> {
    let request = Request::builder().uri(uri).body(Body::empty())?;
    Ok(app.clone().oneshot(request).await?)
}

async fn read_json(response: axum::response::Response) -> Result<Value, Box<dyn std::error::Error>> {
    let bytes = body::to_bytes(response.into_body(), 256 * 1024).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn ws_without_username_is_rejected() -> TestResult {
    let h = harness().await?;

    for uri in ["/ws", "/ws?username="] {
        let response = get(&h.app, uri).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        let json = read_json(response).await?;
        assert_eq!(json["error"], "bad_request");
    }
    Ok(())
}

#[tokio::test]
async fn ws_with_username_but_no_upgrade_is_not_a_session() -> TestResult {
    let h = harness().await?;

    let response = get(&h.app, "/ws?username=alice").await?;

    assert!(response.status().is_client_error());
    assert_eq!(h.node.hub().current_load(), 0);
    Ok(())
}

#[tokio::test]
async fn whitespace_username_passes_name_check() -> TestResult {
    let h = harness().await?;

    // Only the missing upgrade headers stop this request, not the name.
    let response = get(&h.app, "/ws?username=%20%20").await?;

    assert_ne!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.status().is_client_error());
    Ok(())
}

#[tokio::test]
async fn history_is_oldest_first_and_limited() -> TestResult {
    let h = harness().await?;
    for n in 1..=4 {
        h.node
            .store()
            .save(ChatMessage::new("alice", format!("m{n}"), "ws://relay:8080"))
            .await?;
    }

    let response = get(&h.app, "/history?limit=3").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await?;
    let contents: Vec<&str> = json
        .as_array()
        .ok_or("history is not an array")?
        .iter()
        .filter_map(|entry| entry["content"].as_str())
        .collect();
    assert_eq!(contents, ["m2", "m3", "m4"]);
    assert_eq!(json[0]["username"], "alice");
    assert_eq!(json[0]["id"], 2);

    let json = read_json(get(&h.app, "/history").await?).await?;
    assert_eq!(json.as_array().map(Vec::len), Some(4));
    Ok(())
}

#[tokio::test]
async fn history_rejects_bad_limit() -> TestResult {
    let h = harness().await?;

    let response = get(&h.app, "/history?limit=-1").await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn health_degrades_when_bus_is_lost() -> TestResult {
    let h = harness().await?;

    let response = get(&h.app, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await?;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["address"], "ws://relay:8080");
    assert_eq!(json["load"], 0);

    h.bus.sever();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.node.bridge().is_up() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let response = get(&h.app, "/healthz").await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = read_json(response).await?;
    assert_eq!(json["status"], "degraded");
    Ok(())
}

#[tokio::test]
async fn stats_and_metrics_respond() -> TestResult {
    let h = harness().await?;

    let json = read_json(get(&h.app, "/debug/stats").await?).await?;
    assert_eq!(json["active_sessions"], 0);
    assert_eq!(json["bridge_up"], true);

    let response = get(&h.app, "/metrics").await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}
