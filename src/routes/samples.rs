//! Sample collection route
//!
//! Stores raw attestation samples submitted by devices for offline
//! inspection. Nothing in the verification pipeline reads these.

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::error::{ApiError, ApiErrorWithRequestId};
use crate::routes::AppState;
use crate::types::ApiResponse;

/// POST /submit - Store a raw attestation sample
pub async fn submit_sample(
    State(state): State<AppState>,
    Extension(request_id): Extension<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<serde_json::Value>>), ApiErrorWithRequestId> {
    if body.is_empty() {
        return Err(ApiErrorWithRequestId {
            error: ApiError::Validation("empty sample".to_string()),
            request_id,
        });
    }

    sqlx::query("INSERT INTO samples (sample) VALUES (?)")
        .bind(body.to_vec())
        .execute(&state.db)
        .await
        .map_err(|err| ApiErrorWithRequestId {
            error: ApiError::Database(err),
            request_id,
        })?;

    tracing::debug!(request_id = %request_id, size = body.len(), "sample stored");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(serde_json::json!({}), request_id)),
    ))
}
