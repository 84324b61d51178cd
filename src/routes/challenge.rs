//! Challenge issuance route
//!
//! Hands out single-use attestation challenges. Issuance is rate limited
//! per client IP; challenges expire after a bounded window and are consumed
//! by the verification pipeline.

use axum::{
    extract::{ConnectInfo, Extension, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::{ApiError, ApiErrorWithRequestId};
use crate::routes::AppState;
use crate::types::ApiResponse;

/// Response payload for an issued challenge.
#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    /// Base64-encoded 32-byte challenge
    pub challenge: String,
    pub expires_at: DateTime<Utc>,
}

/// POST /challenge - Issue a fresh attestation challenge
pub async fn issue_challenge(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(request_id): Extension<Uuid>,
) -> Result<Json<ApiResponse<ChallengeResponse>>, ApiErrorWithRequestId> {
    if !state.challenge_store.check_rate_limit(addr.ip()).await {
        tracing::warn!(
            request_id = %request_id,
            client_ip = %addr.ip(),
            "challenge issuance rate limited"
        );
        return Err(ApiErrorWithRequestId {
            error: ApiError::TooManyRequests,
            request_id,
        });
    }

    let (challenge, expires_at) = state.challenge_store.issue().await;
    tracing::debug!(request_id = %request_id, "challenge issued");

    Ok(Json(ApiResponse::new(
        ChallengeResponse {
            challenge: STANDARD.encode(challenge),
            expires_at,
        },
        request_id,
    )))
}
