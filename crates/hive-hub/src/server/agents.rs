//! `/agents` routes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use hive_core::{Agent, Message};

use super::AppState;
use super::error::ApiResult;
use crate::agent::SpawnOptions;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(alias = "message")]
    pub content: String,
}

/// `GET /agents`
pub async fn list(State(state): State<AppState>) -> Json<Vec<Agent>> {
    Json(state.hub.list_agents().await)
}

/// `POST /agents`
pub async fn spawn(
    State(state): State<AppState>,
    body: Result<Json<SpawnOptions>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    let Json(opts) = body?;
    let agent = state.hub.spawn_agent(opts).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// `GET /agents/{id}`
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Agent>> {
    Ok(Json(state.hub.get_agent(&id).await?))
}

/// `GET /agents/{id}/status`: re-probe, then return the agent.
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.hub.agent_status(&id).await?))
}

/// `DELETE /agents/{id}`: stop the process, keep the worktree.
pub async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Agent>> {
    Ok(Json(state.hub.stop_agent(&id).await?))
}

/// `POST /agents/{id}/destroy`
pub async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.hub.destroy_agent(&id).await?))
}

/// `POST /agents/{id}/message`
pub async fn message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body?;
    state.hub.message_agent(&id, &req.content).await?;
    Ok(Json(json!({"status": "sent"})))
}

/// `GET /agents/{id}/messages`
pub async fn messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.hub.conversation(&id).await?))
}
