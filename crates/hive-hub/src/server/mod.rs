//! REST + SSE API over a [`Hub`].
//!
//! Errors are JSON `{"error", "kind"}` bodies whose status follows the
//! error kind; see [`ApiError`].

mod agents;
mod error;
mod events;
mod ports;
mod solicitations;
mod tasks;

pub use error::{ApiError, ApiResult, status_for};

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hub::{Hub, StatusInfo};

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

impl AppState {
    pub const fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/agents", get(agents::list).post(agents::spawn))
        .route("/agents/{id}", get(agents::get).delete(agents::stop))
        .route("/agents/{id}/destroy", post(agents::destroy))
        .route("/agents/{id}/message", post(agents::message))
        .route("/agents/{id}/messages", get(agents::messages))
        .route("/agents/{id}/status", get(agents::status))
        .route("/tasks", get(tasks::list).post(tasks::create))
        .route("/tasks/{id}", get(tasks::get).patch(tasks::update))
        .route(
            "/solicitations",
            get(solicitations::list).post(solicitations::create),
        )
        .route("/solicitations/{id}", get(solicitations::get))
        .route("/solicitations/{id}/respond", post(solicitations::respond))
        .route("/solicitations/{id}/dismiss", post(solicitations::dismiss))
        .route("/ports", get(ports::list))
        .route("/ports/acquire", post(ports::acquire))
        .route("/ports/release", post(ports::release))
        .route("/ports/{port}", get(ports::status))
        .route("/ports/{port}/force-release", post(ports::force_release))
        .route("/events", get(events::stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /health`
async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// `GET /status`
async fn status(State(state): State<AppState>) -> Json<StatusInfo> {
    Json(state.hub.status().await)
}
