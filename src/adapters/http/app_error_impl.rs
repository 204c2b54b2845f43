use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::app_error::{AppError, ErrorCode};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = ErrorCode::from(&self);
        let message = self.to_string();

        match &self {
            // Expected outcomes of metering; not worth an error log line
            AppError::RateLimitExceeded { .. } | AppError::NotFound => {
                tracing::info!(error = %message, "Request rejected");
            }
            _ => tracing::error!(error = ?self, "Request failed"),
        }

        match self {
            AppError::RateLimitExceeded {
                service,
                limit,
                limit_value,
                remaining,
                reset_at,
            } => {
                let body = json!({
                    "code": code.as_str(),
                    "service": service,
                    "limit": limit,
                    "limit_value": limit_value,
                    "remaining": remaining,
                    "reset_at": reset_at,
                });
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
            }
            AppError::InvalidTransition { .. }
            | AppError::AlreadyTerminated(_)
            | AppError::DuplicateCharge(_) => error_resp(StatusCode::CONFLICT, code, Some(message)),
            AppError::BillingProvider(msg) => error_resp(StatusCode::BAD_GATEWAY, code, Some(msg)),
            AppError::InvalidInput(msg) => error_resp(StatusCode::BAD_REQUEST, code, Some(msg)),
            AppError::Unauthorized => error_resp(StatusCode::UNAUTHORIZED, code, None),
            AppError::NotFound => error_resp(StatusCode::NOT_FOUND, code, None),
            AppError::Database(_) | AppError::WebhookProcessing { .. } | AppError::Internal(_) => {
                error_resp(StatusCode::INTERNAL_SERVER_ERROR, code, None)
            }
        }
    }
}

fn error_resp(status: StatusCode, code: ErrorCode, message: Option<String>) -> Response {
    let body = match message {
        Some(msg) => json!({ "code": code.as_str(), "message": msg }),
        None => json!({ "code": code.as_str() }),
    };
    (status, Json(body)).into_response()
}
