//! Protocol error taxonomy (§7): every error response carries a stable
//! machine-readable `code`, a human-readable `error`, and optional
//! `details` (source position / raw line for parse-adjacent failures).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A protocol-level failure, mapped to one of the status codes in §6:
/// 400 bad request, 404 not found, 409 invalid state transition,
/// 422 parse/encode failed, 500 internal.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    SessionNotFound(uuid::Uuid),
    InvalidStateTransition { from: String, action: String },
    UnprocessableEntity { message: String, details: serde_json::Value },
    AccessDenied(String),
    Internal(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::NotFound(_) => "NotFound",
            ApiError::SessionNotFound(_) => "SessionNotFound",
            ApiError::InvalidStateTransition { .. } => "InvalidStateTransition",
            ApiError::UnprocessableEntity { .. } => "ParseOrEncodeFailed",
            ApiError::AccessDenied(_) => "AccessDenied",
            ApiError::Internal(_) => "InternalError",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            ApiError::UnprocessableEntity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::NotFound(m) => m.clone(),
            ApiError::SessionNotFound(id) => format!("session {id} not found"),
            ApiError::InvalidStateTransition { from, action } => {
                format!("cannot {action} while session is {from}")
            }
            ApiError::UnprocessableEntity { message, .. } => message.clone(),
            ApiError::AccessDenied(m) => m.clone(),
            ApiError::Internal(m) => m.clone(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::UnprocessableEntity { details, .. } => Some(details.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody { error: self.message(), code: self.code().to_string(), details: self.details() };
        (status, Json(body)).into_response()
    }
}
