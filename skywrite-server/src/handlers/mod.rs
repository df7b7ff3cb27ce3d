//! HTTP handlers for the Skywrite server.

pub mod auth;
pub mod health;
pub mod posts;
