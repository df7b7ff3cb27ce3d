//! # Skywrite Core
//!
//! Server-side engine for the Skywrite scheduled-post dispatcher:
//!
//! - **Authentication**: the network's OAuth 2.0 authorization-code flow
//!   with PKCE, DPoP proof-of-possession key lifecycle, token refresh with
//!   single-flight coordination, and server-nonce tracking.
//! - **Persistence**: encrypted token storage with atomic rotation, the
//!   scheduled-post repository with compare-and-set claims, and append-only
//!   failure/audit logs over PostgreSQL.
//! - **Publication**: DPoP-signed, rate-limited record creation against the
//!   network's XRPC API with transparent refresh and nonce retry.
//! - **Scheduling**: the periodic dispatcher scan, batched execution,
//!   per-post retry accounting, and serialized thread publication.

pub mod auth;
pub mod client;
pub mod crypto;
pub mod error;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};
pub use skywrite_model as model;
