//! `/solicitations` routes.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::solicitation::{CreateSolicitationRequest, Solicitation, SolicitationStatus};

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(flatten)]
    pub request: CreateSolicitationRequest,
    /// Hold the response until the solicitation is resolved.
    #[serde(default)]
    pub wait: bool,
    /// 0 waits indefinitely.
    #[serde(default, alias = "timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    #[serde(alias = "answer")]
    pub response: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DismissBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// `POST /solicitations`. With `wait`, answers once the Queen has.
pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<CreateBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Solicitation>)> {
    let Json(body) = body?;
    let timeout = (body.timeout_secs > 0).then(|| Duration::from_secs(body.timeout_secs));
    let sol = state.hub.solicit(body.request, body.wait, timeout).await?;
    let code = if body.wait {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((code, Json(sol)))
}

/// `GET /solicitations?status=`: open ones by default, `all` for everything.
pub async fn list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Solicitation>>> {
    let Query(q) = query?;
    let status = match q.status.as_deref() {
        None | Some("") => Some(SolicitationStatus::Open),
        Some("all") => None,
        Some(other) => Some(other.parse::<SolicitationStatus>()?),
    };
    Ok(Json(state.hub.solicitations().list(status).await))
}

/// `GET /solicitations/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Solicitation>> {
    Ok(Json(state.hub.solicitations().get(&id).await?))
}

/// `POST /solicitations/{id}/respond`
pub async fn respond(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<RespondBody>, JsonRejection>,
) -> ApiResult<Json<Solicitation>> {
    let Json(body) = body?;
    Ok(Json(state.hub.solicitations().respond(&id, body.response).await?))
}

/// `POST /solicitations/{id}/dismiss`. The body is optional.
pub async fn dismiss(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Solicitation>> {
    let body: DismissBody = if body.is_empty() {
        DismissBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::validation(e.to_string()))?
    };
    Ok(Json(state.hub.solicitations().dismiss(&id, body.reason).await?))
}
