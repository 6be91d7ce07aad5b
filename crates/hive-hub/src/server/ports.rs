//! `/ports` routes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::AppState;
use super::error::ApiResult;
use crate::port::{AcquireRequest, AcquireResponse, PortLease, PortStatus, PortWaiter};

#[derive(Debug, Serialize)]
pub struct PortsOverview {
    pub leases: Vec<PortLease>,
    pub waiters: Vec<PortWaiter>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub port: u16,
    pub agent_id: String,
}

/// `GET /ports`
pub async fn list(State(state): State<AppState>) -> Json<PortsOverview> {
    let ports = state.hub.ports();
    Json(PortsOverview {
        leases: ports.leases().await,
        waiters: ports.waiters().await,
    })
}

/// `GET /ports/{port}`
pub async fn status(State(state): State<AppState>, Path(port): Path<u16>) -> Json<PortStatus> {
    Json(state.hub.ports().status(port).await)
}

/// `POST /ports/acquire`. Busy and timed-out requests are still 200; the
/// outcome is in `status`.
pub async fn acquire(
    State(state): State<AppState>,
    body: Result<Json<AcquireRequest>, JsonRejection>,
) -> ApiResult<Json<AcquireResponse>> {
    let Json(mut req) = body?;
    if req.agent_name.is_empty()
        && let Ok(agent) = state.hub.agents().get(&req.agent_id).await
    {
        req.agent_name = agent.name;
    }
    Ok(Json(state.hub.ports().acquire(req).await?))
}

/// `POST /ports/release`
pub async fn release(
    State(state): State<AppState>,
    body: Result<Json<ReleaseBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    state.hub.ports().release(body.port, &body.agent_id).await?;
    Ok(Json(json!({"released": body.port})))
}

/// `POST /ports/{port}/force-release`
pub async fn force_release(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> ApiResult<Json<PortLease>> {
    Ok(Json(state.hub.ports().force_release(port).await?))
}
