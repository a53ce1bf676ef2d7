//! HTTP error type for the intake API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::forms::FormId;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("User statistics not found")]
    StatisticsNotFound,

    #[error("{0} is not available: analysis tenant not configured")]
    FormUnavailable(FormId),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DocumentNotFound(id) => ApiError::DocumentNotFound(id),
            StoreError::Backend(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized(e) => {
                tracing::warn!("Rejected request: {}", e);
                (StatusCode::UNAUTHORIZED, e.to_string())
            }
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::DocumentNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("Document not found: {}", id))
            }
            ApiError::StatisticsNotFound => {
                (StatusCode::NOT_FOUND, "User statistics not found".to_string())
            }
            ApiError::FormUnavailable(form) => {
                tracing::error!("No analysis tenant configured for {}", form);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("{} is not available", form),
                )
            }
            ApiError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
