//! PostgreSQL persistence: encrypted session rows, scheduled posts, and the
//! append-only failure/audit logs.

mod audit;
mod post_repository;
mod token_store;
mod user_repository;

pub use audit::{AuditEvent, AuditRepository, AuditRow};
pub use post_repository::{PostPage, PostRepository, PostUpdate};
pub use token_store::{ActiveSession, NewSession, SessionMeta, TokenStore};
pub use user_repository::UserRepository;
