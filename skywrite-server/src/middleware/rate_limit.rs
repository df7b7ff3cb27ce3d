//! Inbound admission control.
//!
//! Rate-gating runs before authentication on every inbound surface, so a
//! credential-probing flood never reaches session lookup. The auth
//! endpoints and the post endpoints draw from separate buckets.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::errors::AppError;
use crate::infra::app_state::AppState;
use crate::infra::startup::{INBOUND_API_CLASS, INBOUND_AUTH_CLASS};

fn admit(state: &AppState, class: &str) -> Result<(), AppError> {
    if state.gate.would_exceed(class, 1) {
        return Err(AppError::rate_limited("too many requests"));
    }
    state.gate.record(class, 1);
    Ok(())
}

pub async fn inbound_auth_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match admit(&state, INBOUND_AUTH_CLASS) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

pub async fn inbound_api_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match admit(&state, INBOUND_API_CLASS) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}
