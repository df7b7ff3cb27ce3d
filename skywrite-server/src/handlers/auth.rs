//! OAuth login, callback, logout, and profile endpoints.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use skywrite_model::{RevokeReason, User};

use crate::errors::{AppError, AppResult};
use crate::infra::app_state::AppState;
use crate::middleware::session::{
    CODE_VERIFIER_COOKIE, CurrentSession, OAUTH_COOKIE_MAX_AGE,
    OAUTH_STATE_COOKIE, SESSION_COOKIE, SESSION_COOKIE_MAX_AGE, build_cookie,
    clear_cookie, extract_cookie,
};

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub code: String,
    pub state: String,
    #[serde(default)]
    pub code_verifier: Option<String>,
}

fn user_view(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "did": user.did,
        "handle": user.handle,
        "displayName": user.display_name,
    })
}

fn append_cookie(response: &mut Response, cookie: &str) -> AppResult<()> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|_| AppError::internal("cookie encoding failed"))?;
    response.headers_mut().append(SET_COOKIE, value);
    Ok(())
}

/// `GET /auth/login` — start the authorization flow. Responds with the
/// network's authorization URL and parks the state and verifier in
/// short-lived cookies.
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> AppResult<Response> {
    let start = state.auth.begin_authorization(query.redirect_uri.as_deref())?;

    let mut response =
        Json(json!({ "redirectUrl": start.authorize_url })).into_response();
    append_cookie(
        &mut response,
        &build_cookie(OAUTH_STATE_COOKIE, &start.state, OAUTH_COOKIE_MAX_AGE),
    )?;
    append_cookie(
        &mut response,
        &build_cookie(CODE_VERIFIER_COOKIE, &start.verifier, OAUTH_COOKIE_MAX_AGE),
    )?;
    Ok(response)
}

/// `POST /auth/callback` — finish the flow: exchange the code, persist the
/// session, clear the in-flight cookies, and issue the session cookie.
pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CallbackRequest>,
) -> AppResult<Response> {
    let verifier = body
        .code_verifier
        .or_else(|| extract_cookie(&headers, CODE_VERIFIER_COOKIE))
        .ok_or_else(|| AppError::validation("codeVerifier is required"))?;

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let (user, session_id) = state
        .auth
        .complete_authorization(
            &body.code,
            &body.state,
            &verifier,
            user_agent,
            source_ip,
            &CancellationToken::new(),
        )
        .await?;

    let mut response = Json(json!({
        "user": user_view(&user),
        "sessionId": session_id,
    }))
    .into_response();
    append_cookie(&mut response, &clear_cookie(OAUTH_STATE_COOKIE))?;
    append_cookie(&mut response, &clear_cookie(CODE_VERIFIER_COOKIE))?;
    append_cookie(
        &mut response,
        &build_cookie(
            SESSION_COOKIE,
            &session_id.to_string(),
            SESSION_COOKIE_MAX_AGE,
        ),
    )?;
    Ok(response)
}

/// `POST /auth/logout` — revoke the session row and clear the cookie.
pub async fn logout(
    State(state): State<AppState>,
    session: CurrentSession,
) -> AppResult<Response> {
    state
        .tokens
        .revoke(session.session_id, RevokeReason::Logout)
        .await?;
    info!(session = %session.session_id, "logged out");

    let mut response = Json(json!({ "success": true })).into_response();
    append_cookie(&mut response, &clear_cookie(SESSION_COOKIE))?;
    Ok(response)
}

/// `GET /auth/profile` — the authenticated user.
pub async fn profile(
    State(state): State<AppState>,
    session: CurrentSession,
) -> AppResult<Json<serde_json::Value>> {
    let user = state.users.get(session.user_id).await?;
    Ok(Json(json!({ "user": user_view(&user) })))
}
