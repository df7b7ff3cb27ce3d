//! Wiring: build the application state from configuration and a database
//! pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;

use skywrite_core::auth::{AuthCore, AuthStateStore, NonceCache, OAuthConfig};
use skywrite_core::client::{NetworkClient, RateGate, RecordPublisher};
use skywrite_core::crypto::TokenCipher;
use skywrite_core::scheduler::{
    Dispatcher, DispatcherConfig, PostService, PostStore,
};
use skywrite_core::store::{
    AuditRepository, PostRepository, TokenStore, UserRepository,
};
use skywrite_model::EndpointLimits;

use crate::infra::app_state::AppState;
use crate::infra::config::Config;

/// Endpoint class guarding the inbound auth endpoints against
/// credential-probing floods.
pub const INBOUND_AUTH_CLASS: &str = "inbound_auth";

/// Endpoint class guarding the inbound post endpoints. Gating runs before
/// the session extractor so unauthenticated floods never reach the store.
pub const INBOUND_API_CLASS: &str = "inbound_api";

pub async fn build_state(config: Config, pool: PgPool) -> anyhow::Result<AppState> {
    let cipher = TokenCipher::from_secret(&config.encryption_key)
        .context("encryption key rejected")?;

    let tokens = Arc::new(TokenStore::new(pool.clone(), cipher));
    let users = Arc::new(UserRepository::new(pool.clone()));
    let posts = Arc::new(PostRepository::new(pool.clone()));
    let audit = Arc::new(AuditRepository::new(pool.clone()));

    let gate = Arc::new(RateGate::new(&EndpointLimits::default()));
    gate.register(INBOUND_AUTH_CLASS, 60, Duration::from_secs(60));
    gate.register(INBOUND_API_CLASS, 300, Duration::from_secs(300));

    let states = Arc::new(AuthStateStore::default());
    let nonces = Arc::new(NonceCache::new());

    let http = reqwest::Client::builder()
        .user_agent(concat!("skywrite/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("http client construction failed")?;

    let oauth = OAuthConfig {
        client_id: config.oauth_client_id.clone(),
        client_secret: config.oauth_client_secret.clone(),
        redirect_uri: config.oauth_redirect_uri.clone(),
        authorize_endpoint: config.authorize_endpoint.clone(),
        token_endpoint: config.token_endpoint.clone(),
        service_base: config.service_base.clone(),
        scope: config.oauth_scope.clone(),
        refresh_token_lifetime: chrono::Duration::days(90),
        token_timeout: Duration::from_secs(20),
    };

    let auth = Arc::new(AuthCore::new(
        http.clone(),
        oauth,
        tokens.clone(),
        users.clone(),
        states.clone(),
        nonces.clone(),
        gate.clone(),
    ));

    let network = Arc::new(NetworkClient::new(
        http,
        config.service_base.clone(),
        tokens.clone(),
        users.clone(),
        auth.clone(),
        nonces.clone(),
        gate.clone(),
    ));

    let post_service = Arc::new(PostService::new(
        posts.clone() as Arc<dyn PostStore>,
        network.clone() as Arc<dyn RecordPublisher>,
        vec!["en".to_string()],
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        posts.clone(),
        post_service.clone(),
        tokens.clone(),
        states,
        AuditRepository::new(pool.clone()),
        DispatcherConfig {
            interval: config.dispatcher_interval,
            ..DispatcherConfig::default()
        },
    ));

    Ok(AppState {
        config: Arc::new(config),
        pool,
        tokens,
        users,
        posts,
        audit,
        auth,
        network,
        post_service,
        dispatcher,
        gate,
    })
}
