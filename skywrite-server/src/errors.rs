use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

use skywrite_core::Error as CoreError;

pub type AppResult<T> = Result<T, AppError>;

/// Error kinds surfaced in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidOperation,
    RateLimitExceeded,
    OauthError,
    ServerError,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::ValidationError => "VALIDATION_ERROR",
            ApiErrorKind::Unauthorized => "UNAUTHORIZED",
            ApiErrorKind::Forbidden => "FORBIDDEN",
            ApiErrorKind::NotFound => "NOT_FOUND",
            ApiErrorKind::InvalidOperation => "INVALID_OPERATION",
            ApiErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ApiErrorKind::OauthError => "OAUTH_ERROR",
            ApiErrorKind::ServerError => "SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ApiErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ApiErrorKind::NotFound => StatusCode::NOT_FOUND,
            ApiErrorKind::InvalidOperation => StatusCode::CONFLICT,
            ApiErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorKind::OauthError => StatusCode::BAD_GATEWAY,
            ApiErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    pub kind: ApiErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::RateLimitExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::ServerError, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let mut body = json!({
            "error": self.kind.as_str(),
            "message": self.message,
            "code": status.as_u16(),
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::validation(msg),
            CoreError::AuthExpired | CoreError::SessionExpired => {
                Self::unauthorized("session expired, please log in again")
            }
            CoreError::AuthRejected(_) => {
                Self::unauthorized("authorization was revoked by the network")
            }
            CoreError::AuthNonce | CoreError::Permanent(_) => {
                Self::new(ApiErrorKind::OauthError, err.to_string())
            }
            CoreError::Forbidden(msg) => Self::forbidden(msg),
            CoreError::NotFound(msg) => Self::not_found(msg),
            CoreError::InvalidOperation(msg) => {
                Self::new(ApiErrorKind::InvalidOperation, msg)
            }
            CoreError::RateLimited { retry_after } => {
                Self::rate_limited("rate limit exceeded").with_details(json!({
                    "retryAfterSecs": retry_after.as_secs(),
                }))
            }
            CoreError::CryptoFailure(_) => {
                Self::internal("stored credentials are unreadable")
            }
            CoreError::Transient(_)
            | CoreError::Cancelled
            | CoreError::Database(_)
            | CoreError::Internal(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_the_published_envelope() {
        assert_eq!(ApiErrorKind::ValidationError.as_str(), "VALIDATION_ERROR");
        assert_eq!(
            ApiErrorKind::ValidationError.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiErrorKind::RateLimitExceeded.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn core_errors_collapse_per_contract() {
        let err: AppError = CoreError::SessionExpired.into();
        assert_eq!(err.kind, ApiErrorKind::Unauthorized);

        let err: AppError = CoreError::Forbidden("not yours".into()).into();
        assert_eq!(err.kind, ApiErrorKind::Forbidden);

        let err: AppError = CoreError::CryptoFailure("tag".into()).into();
        assert_eq!(err.kind, ApiErrorKind::ServerError);
    }
}
