//! REST API integration tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use hive_core::Config;
use hive_hub::Hub;
use hive_hub::server::{AppState, build_router};

struct TestApp {
    _dir: tempfile::TempDir,
    hub: Arc<Hub>,
}

/// A hub without a repository: everything but spawning works.
fn app(base_port: u16) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.hub.cache_path = None;
    config.hub.state_path = Some(dir.path().join("hub-state.json"));
    config.worktree.root = dir.path().join("worktrees");
    config.spawner.base_port = base_port;
    config.spawner.port_range = 10;
    let hub = Arc::new(Hub::new(config).unwrap());
    TestApp { _dir: dir, hub }
}

impl TestApp {
    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = build_router(AppState::new(Arc::clone(&self.hub)))
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body)).await
    }

    async fn patch(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::PATCH, uri, Some(body)).await
    }
}

#[tokio::test]
async fn health_and_status() {
    let app = app(42_000);
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.get("/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents_total"], 0);
    assert_eq!(body["solicitations_pending"], 0);
}

#[tokio::test]
async fn spawn_without_repo_is_a_validation_error() {
    let app = app(42_010);
    let (status, body) = app.post("/agents", json!({"name": "drone-1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
    assert!(body["error"].as_str().unwrap().contains("repository"));
}

#[tokio::test]
async fn unknown_agent_is_404() {
    let app = app(42_020);
    let (status, body) = app.get("/agents/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = app
        .post("/agents/ghost/message", json!({"content": "hi"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app.get("/agents").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn task_transitions_over_http() {
    let app = app(42_030);
    let (status, task) = app
        .post("/tasks", json!({"title": "Write docs", "description": "README"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["status"], "pending");
    let id = task["id"].as_str().unwrap().to_string();

    // Completing a pending task is illegal.
    let (status, body) = app
        .patch(&format!("/tasks/{id}"), json!({"action": "complete"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    // Starting needs an agent, and the agent must exist.
    let (status, _) = app
        .patch(&format!("/tasks/{id}"), json!({"action": "start"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app
        .patch(
            &format!("/tasks/{id}"),
            json!({"action": "start", "agent_id": "ghost"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, cancelled) = app
        .patch(
            &format!("/tasks/{id}"),
            json!({"action": "cancel", "error": "no longer needed"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (_, listed) = app.get("/tasks?status=cancelled").await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, listed) = app.get("/tasks?status=pending").await;
    assert_eq!(listed, json!([]));

    let (status, _) = app.get("/tasks?status=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn task_requires_title() {
    let app = app(42_040);
    let (status, body) = app.post("/tasks", json!({"title": "  "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");

    let (status, body) = app.get("/tasks/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn malformed_json_is_rejected_with_error_body() {
    let app = app(42_050);
    let resp = build_router(AppState::new(Arc::clone(&app.hub)))
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/tasks")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn solicitation_round_trip() {
    let app = app(42_060);
    let (status, sol) = app
        .post(
            "/solicitations",
            json!({
                "agent_id": "a1",
                "agent_name": "drone-1",
                "kind": "decision",
                "urgency": "high",
                "question": "Postgres or SQLite?",
                "options": ["postgres", "sqlite"]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sol["status"], "open");
    let id = sol["id"].as_str().unwrap().to_string();

    let (_, open) = app.get("/solicitations").await;
    assert_eq!(open.as_array().unwrap().len(), 1);

    let (status, answered) = app
        .post(
            &format!("/solicitations/{id}/respond"),
            json!({"response": "sqlite"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answered["status"], "answered");
    assert_eq!(answered["answer"], "sqlite");

    // Already answered.
    let (status, _) = app
        .post(
            &format!("/solicitations/{id}/respond"),
            json!({"response": "postgres"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, open) = app.get("/solicitations").await;
    assert_eq!(open, json!([]));
    let (_, all) = app.get("/solicitations?status=all").await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn dismiss_accepts_an_empty_body() {
    let app = app(42_070);
    let (_, sol) = app
        .post(
            "/solicitations",
            json!({"agent_id": "a1", "message": "Still needed?"}),
        )
        .await;
    let id = sol["id"].as_str().unwrap();

    let (status, dismissed) = app
        .send(Method::POST, &format!("/solicitations/{id}/dismiss"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dismissed["status"], "dismissed");

    let (status, body) = app.get(&format!("/solicitations/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dismissed");
}

#[tokio::test]
async fn waiting_solicitation_expires() {
    let app = app(42_080);
    let (status, sol) = app
        .post(
            "/solicitations",
            json!({"agent_id": "a1", "question": "Anyone?", "wait": true, "timeout_secs": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sol["status"], "expired");
}

#[tokio::test]
async fn port_leases_over_http() {
    let app = app(42_090);
    let (status, acquired) = app
        .post(
            "/ports/acquire",
            json!({"port": 42_199, "agent_id": "a1", "service": "vite"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acquired["status"], "acquired");

    let (_, busy) = app
        .post("/ports/acquire", json!({"port": 42_199, "agent_id": "a2"}))
        .await;
    assert_eq!(busy["status"], "busy");
    assert_eq!(busy["held_by"]["agent_id"], "a1");

    let (_, overview) = app.get("/ports").await;
    assert_eq!(overview["leases"].as_array().unwrap().len(), 1);

    let (status, body) = app
        .post("/ports/release", json!({"port": 42_199, "agent_id": "a2"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    let (status, lease) = app.post("/ports/42199/force-release", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lease["agent_id"], "a1");

    let (_, port) = app.get("/ports/42199").await;
    assert_eq!(port["status"], "free");

    let (status, _) = app.post("/ports/42199/force-release", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_stream_ends_on_stop() {
    let app = app(42_100);
    let router = build_router(AppState::new(Arc::clone(&app.hub)));
    let resp = router
        .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    app.hub
        .tasks()
        .create(hive_hub::task::CreateTaskRequest {
            title: "streamed".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    app.hub.stop().await.unwrap();

    let bytes = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        axum::body::to_bytes(resp.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: task.created"), "{text}");
    assert!(text.contains("streamed"));
}
