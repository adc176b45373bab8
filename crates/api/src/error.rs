//! API error handling
//!
//! Maps billing errors onto HTTP responses with a uniform JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sekolah_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

/// Transparent wrapper so handlers can `?` billing errors straight into an
/// HTTP response.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] BillingError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BillingError::NotFound(_) => StatusCode::NOT_FOUND,
            BillingError::Conflict(_) => StatusCode::CONFLICT,
            BillingError::Validation(_) | BillingError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
            BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
            BillingError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();

        // Internal detail never leaves the server.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %message, "Internal server error");
            "Internal server error".to_string()
        } else {
            message
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
