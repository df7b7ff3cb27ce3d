//! # Skywrite Server
//!
//! HTTP boundary for the Skywrite scheduled-post dispatcher.
//!
//! ## Overview
//!
//! The server exposes the OAuth login flow and the scheduled-post CRUD
//! surface, and hosts the dispatcher that publishes due posts to the
//! network on the owners' behalf:
//!
//! - **Authentication**: the network's OAuth 2.0 + PKCE + DPoP flow, with
//!   sessions persisted encrypted at rest
//! - **Scheduling**: create, list, edit, and cancel future posts
//! - **Dispatch**: a periodic scan publishes due posts with at-most-once
//!   semantics
//!
//! ## Architecture
//!
//! The server is built on Axum and uses PostgreSQL for persistent storage;
//! all outbound traffic to the network goes through the DPoP-signed,
//! rate-gated client in `skywrite-core`.

pub mod errors;
pub mod handlers;
pub mod infra;
pub mod middleware;
pub mod routes;
