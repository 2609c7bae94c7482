//! API error types and HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use workbridge_billing::BillingError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    /// Status code, machine-readable code, and user-facing message
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                self.to_string(),
            ),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", self.to_string())
            }
            ApiError::Billing(e) => match e {
                BillingError::SubscriptionNotFound(_)
                | BillingError::CustomerNotFound(_)
                | BillingError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", e.to_string())
                }
                BillingError::InvalidInput(_) | BillingError::UnrecognizedPlan(_) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", e.to_string())
                }
                BillingError::WebhookSignatureInvalid => (
                    StatusCode::BAD_REQUEST,
                    "INVALID_SIGNATURE",
                    e.to_string(),
                ),
                BillingError::PaymentMethodRequired => (
                    StatusCode::PAYMENT_REQUIRED,
                    "PAYMENT_METHOD_REQUIRED",
                    e.to_string(),
                ),
                // Processor messages are passed through; internal details are
                // not.
                BillingError::StripeApi(msg) => (
                    StatusCode::BAD_GATEWAY,
                    "PAYMENT_PROCESSOR_ERROR",
                    msg.clone(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                ),
            },
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_not_found_maps_to_404() {
        let err = ApiError::Billing(BillingError::SubscriptionNotFound("u1".to_string()));
        let (status, code, _) = err.parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");
    }

    #[test]
    fn signature_failure_maps_to_400() {
        let err = ApiError::Billing(BillingError::WebhookSignatureInvalid);
        let (status, code, _) = err.parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "INVALID_SIGNATURE");
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let err = ApiError::Internal(anyhow::anyhow!("connection pool exhausted"));
        let (status, _, message) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!message.contains("pool"));
    }
}
