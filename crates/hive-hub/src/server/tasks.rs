//! `/tasks` routes.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use super::AppState;
use super::error::ApiResult;
use crate::hub::TaskUpdate;
use crate::task::{CreateTaskRequest, Task, TaskStatus};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub agent_id: Option<String>,
    pub status: Option<String>,
}

/// `POST /tasks`
pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let Json(req) = body?;
    let task = state.hub.create_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks?agent_id=&status=`. `agent_id` also accepts a name.
pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Task>>> {
    let Query(q) = query?;
    let status = q
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let agent_id = match q.agent_id.filter(|a| !a.is_empty()) {
        Some(wanted) => Some(
            state
                .hub
                .agents()
                .get(&wanted)
                .await
                .map_or(wanted, |agent| agent.id),
        ),
        None => None,
    };
    Ok(Json(state.hub.tasks().list(agent_id.as_deref(), status).await))
}

/// `GET /tasks/{id}`
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    Ok(Json(state.hub.tasks().get(&id).await?))
}

/// `PATCH /tasks/{id}` with `{"action": "start"|"complete"|"fail"|"cancel", ...}`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<TaskUpdate>, JsonRejection>,
) -> ApiResult<Json<Task>> {
    let Json(update) = body?;
    Ok(Json(state.hub.update_task(&id, update).await?))
}
