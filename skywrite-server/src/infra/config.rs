use std::env;
use std::time::Duration;

use anyhow::{Context, bail};

/// Server configuration loaded from environment variables. Absence of a
/// required value is fatal at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Database settings
    pub database_url: String,

    // OAuth client settings
    /// The public client-metadata URL the network resolves for this client.
    pub oauth_client_id: String,
    /// May be empty for public clients.
    pub oauth_client_secret: Option<String>,
    pub oauth_redirect_uri: String,
    pub oauth_scope: String,
    pub authorize_endpoint: String,
    pub token_endpoint: String,

    // Network settings
    pub service_base: String,

    // At-rest encryption secret for tokens and DPoP keys (>= 32 bytes)
    pub encryption_key: String,

    // Dispatcher settings
    pub dispatcher_interval: Duration,

    // CORS settings
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let oauth_client_id =
            env::var("OAUTH_CLIENT_ID").context("OAUTH_CLIENT_ID is required")?;
        let oauth_redirect_uri = env::var("OAUTH_REDIRECT_URI")
            .context("OAUTH_REDIRECT_URI is required")?;
        let encryption_key =
            env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY is required")?;
        if encryption_key.len() < 32 {
            bail!("ENCRYPTION_KEY must be at least 32 bytes");
        }

        let service_base = env::var("ATPROTO_HOST")
            .unwrap_or_else(|_| "https://bsky.social".to_string());
        let service_trimmed = service_base.trim_end_matches('/').to_string();

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),

            database_url,

            oauth_client_id,
            oauth_client_secret: env::var("OAUTH_CLIENT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            oauth_redirect_uri,
            oauth_scope: env::var("OAUTH_SCOPE")
                .unwrap_or_else(|_| "atproto transition:generic".to_string()),
            authorize_endpoint: env::var("OAUTH_AUTHORIZE_ENDPOINT")
                .unwrap_or_else(|_| format!("{service_trimmed}/oauth/authorize")),
            token_endpoint: env::var("OAUTH_TOKEN_ENDPOINT")
                .unwrap_or_else(|_| format!("{service_trimmed}/oauth/token")),

            service_base: service_trimmed,

            encryption_key,

            dispatcher_interval: Duration::from_secs(
                env::var("DISPATCHER_INTERVAL_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
            ),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        })
    }
}
