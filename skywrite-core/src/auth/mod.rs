//! OAuth 2.0 + DPoP authentication core.

pub mod core;
pub mod dpop;
pub mod nonce;
pub mod pkce;
pub mod state;

pub use core::{AuthCore, AuthorizationStart, OAuthConfig, REFRESH_SKEW};
pub use dpop::{DpopKey, PublicJwk};
pub use nonce::NonceCache;
pub use state::{AuthStateStore, PendingAuthorization};
