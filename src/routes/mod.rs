//! Route modules and router assembly
//!
//! Route structure:
//! - `/health`, `/ready` - monitoring endpoints
//! - `POST /challenge` - issue an attestation challenge
//! - `POST /verify` - verify a serialized attestation message
//! - `POST /submit` - sample collection endpoint

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::services::{ChallengeStore, Verifier};

pub mod challenge;
pub mod health;
pub mod samples;
pub mod verify;

/// Transport-level cap on request bodies.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub challenge_store: Arc<ChallengeStore>,
    pub verifier: Arc<Verifier>,
    pub config: Arc<Config>,
}

/// Creates the main API router with all routes.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/challenge", post(challenge::issue_challenge))
        .route("/verify", post(verify::verify_attestation))
        .route("/submit", post(samples::submit_sample))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}
