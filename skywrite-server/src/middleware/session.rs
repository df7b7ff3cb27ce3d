//! Cookie handling and the authenticated-session extractor.

use axum::http::{HeaderMap, request::Parts};
use axum::extract::FromRequestParts;
use chrono::Utc;

use skywrite_model::{SessionId, UserId};

use crate::errors::AppError;
use crate::infra::app_state::AppState;

pub const SESSION_COOKIE: &str = "session_id";
pub const OAUTH_STATE_COOKIE: &str = "oauth_state";
pub const CODE_VERIFIER_COOKIE: &str = "code_verifier";

/// Ten minutes for the in-flight OAuth cookies.
pub const OAUTH_COOKIE_MAX_AGE: u64 = 600;
/// Thirty days for the session cookie.
pub const SESSION_COOKIE_MAX_AGE: u64 = 30 * 24 * 60 * 60;

pub fn build_cookie(name: &str, value: &str, max_age_secs: u64) -> String {
    format!(
        "{name}={value}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={max_age_secs}"
    )
}

/// Clearing re-sets the cookie with Max-Age=0.
pub fn clear_cookie(name: &str) -> String {
    format!("{name}=; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=0")
}

pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get("cookie")?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|cookie| {
            let parts: Vec<&str> = cookie.trim().splitn(2, '=').collect();
            if parts.len() == 2 && parts[0] == name {
                Some(parts[1].to_string())
            } else {
                None
            }
        })
}

/// The authenticated caller, resolved from the `session_id` cookie or the
/// `X-Session-ID` header.
#[derive(Debug, Clone, Copy)]
pub struct CurrentSession {
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = extract_cookie(&parts.headers, SESSION_COOKIE)
            .or_else(|| {
                parts
                    .headers
                    .get("X-Session-ID")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .ok_or_else(|| AppError::unauthorized("authentication required"))?;

        let session_id: SessionId = raw
            .parse()
            .map_err(|_| AppError::unauthorized("malformed session id"))?;

        let meta = state
            .tokens
            .peek(session_id)
            .await
            .map_err(|_| AppError::unauthorized("unknown session"))?;
        if !meta.is_active || meta.refresh_expires_at <= Utc::now() {
            return Err(AppError::unauthorized("session expired, please log in again"));
        }

        state.tokens.touch(session_id).await.ok();

        Ok(CurrentSession {
            session_id,
            user_id: meta.user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_round_trip() {
        let cookie = build_cookie(SESSION_COOKIE, "abc123", SESSION_COOKIE_MAX_AGE);
        assert!(cookie.starts_with("session_id=abc123;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=2592000"));

        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("other=x; session_id=abc123; more=y"),
        );
        assert_eq!(
            extract_cookie(&headers, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
        assert!(extract_cookie(&headers, "missing").is_none());
    }

    #[test]
    fn clearing_sets_zero_max_age() {
        assert!(clear_cookie(OAUTH_STATE_COOKIE).contains("Max-Age=0"));
    }
}
