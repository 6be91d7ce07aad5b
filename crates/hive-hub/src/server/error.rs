//! JSON error responses.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use hive_core::ErrorKind;

use crate::agent::AgentError;
use crate::hub::HubError;
use crate::port::PortError;
use crate::solicitation::SolicitationError;
use crate::task::TaskError;

/// Error body: `{"error": "<message>", "kind": "<kind>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(kind = %self.kind, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(json!({"error": self.message, "kind": self.kind})),
        )
            .into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

macro_rules! via_hub_error {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ApiError {
            fn from(e: $ty) -> Self {
                HubError::from(e).into()
            }
        })*
    };
}

via_hub_error!(AgentError, TaskError, SolicitationError, PortError);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            kind: ErrorKind::Validation,
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
