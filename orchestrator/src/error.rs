//! Control-plane error shape (C10): translates [`shared::OrchestratorError`] (and
//! a couple of API-local variants) into the `{success:false, error, error_code?,
//! error_type?}` JSON body spec §6 mandates, and into the right HTTP status.
//!
//! Grounded on `server/src/api.rs`'s `ApiError` + `IntoResponse` pair — same
//! shape, same "one enum owns the status-code mapping" idiom.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use shared::OrchestratorError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("license not activated")]
    LicenseNotActivated,
    #[error("license expired")]
    LicenseExpired,
    #[error("task limit reached")]
    TaskLimitReached,
    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<OrchestratorError>() {
            Ok(OrchestratorError::Validation(m)) => ApiError::Validation(m),
            Ok(OrchestratorError::Conflict(m)) => ApiError::Conflict(m),
            Ok(OrchestratorError::NotFound(m)) => ApiError::NotFound(m),
            Ok(OrchestratorError::LicenseNotActivated) => ApiError::LicenseNotActivated,
            Ok(OrchestratorError::LicenseExpired) => ApiError::LicenseExpired,
            Ok(OrchestratorError::TaskLimitReached) => ApiError::TaskLimitReached,
            Ok(other) => ApiError::Internal(other.to_string()),
            Err(other) => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, error_type) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, None, Some("validation_error")),
            ApiError::Conflict(_) => (StatusCode::BAD_REQUEST, None, Some("conflict")),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, None, Some("not_found")),
            ApiError::LicenseNotActivated => (
                StatusCode::FORBIDDEN,
                Some("LICENSE_NOT_ACTIVATED"),
                Some("license_error"),
            ),
            ApiError::LicenseExpired => (
                StatusCode::FORBIDDEN,
                Some("LICENSE_EXPIRED"),
                Some("license_error"),
            ),
            ApiError::TaskLimitReached => (
                StatusCode::FORBIDDEN,
                Some("TASK_LIMIT_REACHED"),
                Some("license_error"),
            ),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                Some("internal_error"),
            ),
        };

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": error_code,
            "error_type": error_type,
        }));
        (status, body).into_response()
    }
}
