//! Server infrastructure: configuration and shared application state.

pub mod app_state;
pub mod config;
pub mod startup;

pub use app_state::AppState;
pub use config::Config;
