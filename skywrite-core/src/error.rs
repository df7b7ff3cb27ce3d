use std::time::Duration;

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds distinct at the component boundary.
///
/// Each component recovers only the kinds it has meaningful action on:
/// the auth core handles refresh, the network client handles nonce and one
/// reactive refresh, the rate gate only denies, the post service accounts
/// retries, and the dispatcher isolates per-post failures. Everything else
/// propagates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The access token is expired or was rejected; recoverable by one
    /// refresh.
    #[error("access token expired")]
    AuthExpired,

    /// The refresh token was rejected; the session is permanently broken.
    #[error("refresh rejected: {0}")]
    AuthRejected(String),

    /// A second consecutive DPoP nonce challenge on the same call.
    #[error("DPoP nonce negotiation failed")]
    AuthNonce,

    /// No usable session: inactive, revoked, or past refresh expiry.
    #[error("session expired or revoked")]
    SessionExpired,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// 5xx or connectivity; eligible for bounded retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable 4xx or malformed payload.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Stored ciphertext failed authentication. Fatal for the session.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the post service may reschedule the post after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited { .. })
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

impl From<skywrite_model::ModelError> for Error {
    fn from(err: skywrite_model::ModelError) -> Self {
        Error::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Transient(err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_kind() {
        assert!(Error::Transient("503".into()).is_retryable());
        assert!(
            Error::RateLimited {
                retry_after: Duration::from_secs(60)
            }
            .is_retryable()
        );
        assert!(!Error::Permanent("400".into()).is_retryable());
        assert!(!Error::AuthRejected("invalid_grant".into()).is_retryable());
        assert!(!Error::CryptoFailure("tag mismatch".into()).is_retryable());
    }
}
