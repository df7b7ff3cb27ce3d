use std::fmt;
use std::sync::Arc;

use sqlx::PgPool;

use skywrite_core::auth::AuthCore;
use skywrite_core::client::{NetworkClient, RateGate};
use skywrite_core::scheduler::{Dispatcher, PostService};
use skywrite_core::store::{
    AuditRepository, PostRepository, TokenStore, UserRepository,
};

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub tokens: Arc<TokenStore>,
    pub users: Arc<UserRepository>,
    pub posts: Arc<PostRepository>,
    pub audit: Arc<AuditRepository>,
    pub auth: Arc<AuthCore>,
    pub network: Arc<NetworkClient>,
    pub post_service: Arc<PostService>,
    pub dispatcher: Arc<Dispatcher>,
    pub gate: Arc<RateGate>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
