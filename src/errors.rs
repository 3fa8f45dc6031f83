use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::provider::ProviderError;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("invalid, expired, or missing token")]
    Unauthorized,

    #[error("admin token required")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("provisioning timed out: {0}")]
    ProvisioningTimeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            // Bad region / empty key surface as 404, same as the public API has always done.
            AppError::Validation(_) => StatusCode::NOT_FOUND,
            AppError::InsufficientFunds => StatusCode::FORBIDDEN,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::ProvisioningTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, code, msg) = match &self {
            AppError::Validation(reason) => (
                "invalid_request_error",
                "invalid_endpoint_request",
                reason.clone(),
            ),
            AppError::InsufficientFunds => (
                "billing_error",
                "insufficient_funds",
                "Insufficient funds.".to_string(),
            ),
            AppError::Unauthorized => (
                "authentication_error",
                "invalid_token",
                "Invalid, expired, or missing token.".to_string(),
            ),
            AppError::Forbidden => (
                "permission_error",
                "admin_required",
                "this route requires an admin token".to_string(),
            ),
            AppError::NotFound(what) => (
                "not_found_error",
                "not_found",
                format!("{} not found", what),
            ),
            AppError::Conflict(reason) => ("conflict_error", "conflict", reason.clone()),
            AppError::Provider(e) => {
                tracing::warn!("provider error: {}", e);
                ("upstream_error", "provider_failed", e.to_string())
            }
            AppError::ProvisioningTimeout(detail) => (
                "timeout_error",
                "provisioning_timeout",
                detail.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
