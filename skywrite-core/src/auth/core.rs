//! The network-specified OAuth 2.0 authorization-code flow with PKCE, and
//! refresh coordination for established sessions.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use skywrite_model::{RevokeReason, SessionId, User};

use crate::auth::dpop::DpopKey;
use crate::auth::nonce::NonceCache;
use crate::auth::pkce;
use crate::auth::state::AuthStateStore;
use crate::client::rate_gate::{ENDPOINT_OAUTH, RateGate};
use crate::error::{Error, Result};
use crate::store::{ActiveSession, NewSession, TokenStore, UserRepository};

/// Proactive-refresh skew: tokens within this window of expiry are renewed
/// before use.
pub const REFRESH_SKEW: chrono::Duration = chrono::Duration::seconds(30);

/// Transient-failure retry budget for token endpoint calls.
const TOKEN_RETRY_BUDGET: u32 = 3;

/// OAuth client configuration. `client_id` is the public metadata URL the
/// network resolves for client registration.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    /// Base URL of the network host requests are published to.
    pub service_base: String,
    pub scope: String,
    /// Refresh-token lifetime used to advance `refresh_expires_at` on
    /// issuance and rotation.
    pub refresh_token_lifetime: chrono::Duration,
    pub token_timeout: Duration,
}

impl OAuthConfig {
    pub fn service_host(&self) -> String {
        Url::parse(&self.service_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.service_base.clone())
    }
}

/// Everything the HTTP layer needs to send the user off to authorize.
#[derive(Debug, Clone)]
pub struct AuthorizationStart {
    pub authorize_url: String,
    pub state: String,
    pub verifier: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    #[allow(dead_code)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionIdentity {
    did: String,
    handle: String,
}

/// PKCE-bound authorization, DPoP key lifecycle, token issuance and
/// rotation, and server-nonce negotiation.
pub struct AuthCore {
    http: reqwest::Client,
    config: OAuthConfig,
    tokens: Arc<TokenStore>,
    users: Arc<UserRepository>,
    states: Arc<AuthStateStore>,
    nonces: Arc<NonceCache>,
    gate: Arc<RateGate>,
    refresh_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for AuthCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCore")
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

impl AuthCore {
    pub fn new(
        http: reqwest::Client,
        config: OAuthConfig,
        tokens: Arc<TokenStore>,
        users: Arc<UserRepository>,
        states: Arc<AuthStateStore>,
        nonces: Arc<NonceCache>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self {
            http,
            config,
            tokens,
            users,
            states,
            nonces,
            gate,
            refresh_locks: DashMap::new(),
        }
    }

    pub fn state_store(&self) -> &AuthStateStore {
        &self.states
    }

    /// Step one of the flow: produce the PKCE pair and the authorization
    /// URL, and remember the state server-side for the callback.
    pub fn begin_authorization(&self, redirect_uri: Option<&str>) -> Result<AuthorizationStart> {
        let redirect_uri = redirect_uri.unwrap_or(&self.config.redirect_uri);
        let verifier = pkce::generate_verifier();
        let challenge = pkce::challenge_s256(&verifier);
        let state = fresh_state();

        self.states
            .insert(state.clone(), verifier.clone(), redirect_uri.to_string())?;

        let mut authorize_url = Url::parse(&self.config.authorize_endpoint)
            .map_err(|e| Error::Internal(format!("authorize endpoint: {e}")))?;
        authorize_url
            .query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        debug!(state = %state, "authorization started");
        Ok(AuthorizationStart {
            authorize_url: authorize_url.to_string(),
            state,
            verifier,
        })
    }

    /// Callback half of the flow: validate state and verifier, exchange the
    /// code, fetch the caller's identity, and persist the session.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        verifier: &str,
        user_agent: Option<String>,
        source_ip: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(User, SessionId)> {
        let pending = self
            .states
            .take(state)
            .ok_or_else(|| Error::Validation("unknown or expired state".to_string()))?;
        if pending.verifier != verifier {
            return Err(Error::Validation(
                "code verifier does not match the authorization request".to_string(),
            ));
        }

        let dpop_key = DpopKey::generate();

        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", pending.redirect_uri.clone()),
            ("client_id", self.config.client_id.clone()),
            ("code_verifier", pending.verifier.clone()),
        ];
        let (token_response, last_nonce) =
            self.token_request(&form, &dpop_key, None, cancel).await?;

        let identity = self
            .fetch_identity(&token_response.access_token, &dpop_key, last_nonce.clone(), cancel)
            .await?;

        let user = self
            .users
            .upsert_by_did(&identity.did, &identity.handle, None)
            .await?;
        if let Some(nonce) = last_nonce {
            self.nonces
                .store(user.id, &self.config.service_host(), nonce);
        }

        let now = Utc::now();
        let session_id = self
            .tokens
            .put(NewSession {
                user_id: user.id,
                access_token: token_response.access_token,
                refresh_token: token_response.refresh_token,
                dpop_key,
                access_expires_at: now + chrono::Duration::seconds(token_response.expires_in),
                refresh_expires_at: now + self.config.refresh_token_lifetime,
                user_agent,
                source_ip,
            })
            .await?;

        info!(user = %user.id, handle = %user.handle, "authorization completed");
        Ok((user, session_id))
    }

    /// Refresh a session's tokens, serialized per session id.
    ///
    /// Concurrent callers wait on the in-flight refresh and reuse its
    /// result: after taking the lock the session is re-read, and a token
    /// that is no longer near expiry means another flight already rotated.
    pub async fn refresh_session(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession> {
        let lock = self
            .refresh_locks
            .entry(session_id.to_uuid())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Wait-and-recheck: the previous holder may have refreshed for us.
        let session = self.tokens.get(session_id).await?;
        if !session.access_needs_refresh() {
            debug!(session = %session_id, "refresh satisfied by in-flight rotation");
            return Ok(session);
        }

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", session.refresh_token.as_str().to_string()),
            ("client_id", self.config.client_id.clone()),
            ("scope", self.config.scope.clone()),
        ];

        let initial_nonce = self
            .nonces
            .get(session.user_id, &self.config.service_host());
        let outcome = self
            .token_request(&form, &session.dpop_key, initial_nonce, cancel)
            .await;

        let (token_response, last_nonce) = match outcome {
            Ok(ok) => ok,
            Err(Error::AuthRejected(reason)) => {
                // The refresh token is dead; the session cannot recover.
                warn!(session = %session_id, %reason, "refresh rejected, revoking session");
                self.tokens
                    .revoke(session_id, RevokeReason::RefreshRejected)
                    .await?;
                return Err(Error::AuthRejected(reason));
            }
            Err(other) => return Err(other),
        };

        if let Some(nonce) = last_nonce {
            self.nonces
                .store(session.user_id, &self.config.service_host(), nonce);
        }

        let now = Utc::now();
        self.tokens
            .rotate(
                session_id,
                &token_response.access_token,
                &token_response.refresh_token,
                now + chrono::Duration::seconds(token_response.expires_in),
                now + self.config.refresh_token_lifetime,
                None,
            )
            .await?;

        info!(session = %session_id, "tokens rotated");
        self.tokens.get(session_id).await
    }

    /// POST to the token endpoint with a DPoP proof, negotiating at most
    /// one server-nonce challenge and retrying transient failures within
    /// the budget. Returns the parsed response and the last nonce seen.
    async fn token_request(
        &self,
        form: &[(&str, String)],
        dpop_key: &DpopKey,
        initial_nonce: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(TokenResponse, Option<String>)> {
        let mut nonce = initial_nonce;
        let mut nonce_retry_spent = false;
        let mut attempt = 0u32;

        loop {
            self.gate
                .wait_for_availability(ENDPOINT_OAUTH, 1, cancel)
                .await?;

            let proof = dpop_key.mint_proof("POST", &self.config.token_endpoint, nonce.as_deref())?;
            let request = self
                .http
                .post(&self.config.token_endpoint)
                .timeout(self.config.token_timeout)
                .header("DPoP", proof)
                .form(form);

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = request.send() => sent,
            };

            let response = match response {
                Ok(resp) => resp,
                Err(err) => {
                    let err: Error = err.into();
                    if err.is_retryable() && attempt + 1 < TOKEN_RETRY_BUDGET {
                        attempt += 1;
                        backoff_sleep(attempt, cancel).await?;
                        continue;
                    }
                    return Err(err);
                }
            };

            if let Some(new_nonce) = header_string(&response, "DPoP-Nonce") {
                nonce = Some(new_nonce);
            }

            let status = response.status();
            if status.is_success() {
                let parsed = response
                    .json::<TokenResponse>()
                    .await
                    .map_err(|e| Error::Permanent(format!("malformed token response: {e}")))?;
                return Ok((parsed, nonce));
            }

            let retry_after = retry_after(response.headers(), 60);
            let body = response.json::<ErrorBody>().await.unwrap_or(ErrorBody {
                error: None,
                error_description: None,
            });
            let error_code = body.error.as_deref().unwrap_or_default();

            if error_code == "use_dpop_nonce" {
                if nonce_retry_spent || nonce.is_none() {
                    return Err(Error::AuthNonce);
                }
                nonce_retry_spent = true;
                continue;
            }
            if error_code == "invalid_grant" {
                return Err(Error::AuthRejected(
                    body.error_description
                        .unwrap_or_else(|| "invalid_grant".to_string()),
                ));
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::RateLimited { retry_after });
            }
            if status.is_server_error() {
                if attempt + 1 < TOKEN_RETRY_BUDGET {
                    attempt += 1;
                    backoff_sleep(attempt, cancel).await?;
                    continue;
                }
                return Err(Error::Transient(format!("token endpoint returned {status}")));
            }

            return Err(Error::Permanent(format!(
                "token endpoint returned {status}: {error_code}"
            )));
        }
    }

    /// Resolve the authorized account's DID and handle.
    async fn fetch_identity(
        &self,
        access_token: &str,
        dpop_key: &DpopKey,
        mut nonce: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SessionIdentity> {
        let url = format!(
            "{}/xrpc/com.atproto.server.getSession",
            self.config.service_base.trim_end_matches('/')
        );

        let mut nonce_retry_spent = false;
        loop {
            let proof = dpop_key.mint_proof("GET", &url, nonce.as_deref())?;
            let request = self
                .http
                .get(&url)
                .timeout(self.config.token_timeout)
                .header("Authorization", format!("DPoP {access_token}"))
                .header("DPoP", proof);

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = request.send() => sent.map_err(Error::from)?,
            };

            if let Some(new_nonce) = header_string(&response, "DPoP-Nonce") {
                nonce = Some(new_nonce);
            }

            let status = response.status();
            if status.is_success() {
                return response
                    .json::<SessionIdentity>()
                    .await
                    .map_err(|e| Error::Permanent(format!("malformed identity response: {e}")));
            }

            if status == StatusCode::UNAUTHORIZED && !nonce_retry_spent && nonce.is_some() {
                let body = response.json::<ErrorBody>().await.ok();
                let is_nonce_challenge = body
                    .and_then(|b| b.error)
                    .is_some_and(|e| e == "use_dpop_nonce");
                if is_nonce_challenge {
                    nonce_retry_spent = true;
                    continue;
                }
                return Err(Error::AuthExpired);
            }

            if status.is_server_error() {
                return Err(Error::Transient(format!("identity fetch returned {status}")));
            }
            return Err(Error::Permanent(format!("identity fetch returned {status}")));
        }
    }
}

fn fresh_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn retry_after(headers: &reqwest::header::HeaderMap, default_secs: u64) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default_secs))
}

async fn backoff_sleep(attempt: u32, cancel: &CancellationToken) -> Result<()> {
    let delay = Duration::from_millis(500 * 2u64.pow(attempt.min(4)));
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

impl ActiveSession {
    /// Whether the access token is within the proactive-refresh window.
    pub fn access_needs_refresh(&self) -> bool {
        self.access_expires_at <= Utc::now() + REFRESH_SKEW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OAuthConfig {
        OAuthConfig {
            client_id: "https://app.example/client-metadata.json".to_string(),
            client_secret: None,
            redirect_uri: "https://app.example/auth/callback".to_string(),
            authorize_endpoint: "https://bsky.social/oauth/authorize".to_string(),
            token_endpoint: "https://bsky.social/oauth/token".to_string(),
            service_base: "https://bsky.social".to_string(),
            scope: "atproto transition:generic".to_string(),
            refresh_token_lifetime: chrono::Duration::days(90),
            token_timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn service_host_is_bare_hostname() {
        assert_eq!(test_config().service_host(), "bsky.social");
    }

    #[test]
    fn authorization_url_carries_pkce_and_state() {
        let config = test_config();
        let verifier = pkce::generate_verifier();
        let challenge = pkce::challenge_s256(&verifier);
        let mut url = Url::parse(&config.authorize_endpoint).unwrap();
        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &config.scope)
            .append_pair("state", "opaque-state")
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["code_challenge"], challenge);
        assert_eq!(pairs["scope"], "atproto transition:generic");
    }
}
