//! API response and error types.
//!
//! Maps the internal error taxonomy onto the HTTP surface: 400 validation,
//! 401/403 auth, 404 unknown entity, 409 verification/version conflicts,
//! 429 rate limits (with a reset hint), 503 store unavailable, 500 the rest.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::error::ServiceError;
use crate::store::StoreError;

/// Error payload returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// API error: status code plus a stable machine-readable code.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.code.to_string(),
            message: self.message,
            retry_after_secs: self.retry_after_secs,
            timestamp: Utc::now(),
        };

        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ServiceError::from(e).into()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Validation(message) => ApiError::bad_request(message),
            ServiceError::Unauthorized => ApiError::unauthorized("missing or invalid credentials"),
            ServiceError::Forbidden(message) => ApiError::forbidden(message),
            ServiceError::NotFound(message) => ApiError::not_found(message),
            ServiceError::RateLimited { retry_after } => {
                let mut error = ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "verification issuance budget exhausted",
                );
                error.retry_after_secs = Some(retry_after.as_secs().max(1));
                error
            }
            ServiceError::VerificationNotFound => {
                ApiError::not_found("no pending verification for this phone")
            }
            ServiceError::VerificationExpired => ApiError::new(
                StatusCode::CONFLICT,
                "verification_expired",
                "the verification code expired",
            ),
            ServiceError::InvalidCode { attempts_left } => ApiError::new(
                StatusCode::CONFLICT,
                "invalid_code",
                format!("incorrect code, {attempts_left} attempts left"),
            ),
            ServiceError::AttemptsExhausted => ApiError::new(
                StatusCode::CONFLICT,
                "verification_exhausted",
                "too many incorrect codes, request a new verification",
            ),
            ServiceError::Store(StoreError::Unavailable(_))
            | ServiceError::Store(StoreError::Timeout(_)) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "the document store is unreachable and no cached copy exists",
            ),
            ServiceError::Store(StoreError::VersionConflict { .. }) => ApiError::new(
                StatusCode::CONFLICT,
                "version_conflict",
                "concurrent update detected, retry",
            ),
            ServiceError::Queue(e) => ApiError::internal(format!("write could not be queued: {e}")),
            ServiceError::Cache(message) => ApiError::internal(message),
            other => ApiError::internal(other.to_string()),
        }
    }
}
