//! Attestation verification route
//!
//! Accepts the raw serialized attestation message and returns the textual
//! verification report, or a fixed error message with a non-2xx status.

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::{ApiError, ApiErrorWithRequestId};
use crate::routes::AppState;
use crate::services::MAX_MESSAGE_SIZE;

/// POST /verify - Verify a serialized attestation message
pub async fn verify_attestation(
    State(state): State<AppState>,
    Extension(request_id): Extension<Uuid>,
    body: Bytes,
) -> Result<Response, ApiErrorWithRequestId> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ApiErrorWithRequestId {
            error: ApiError::Validation("attestation message too large".to_string()),
            request_id,
        });
    }

    match state.verifier.verify_serialized(&body, request_id).await {
        Ok(result) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            result.report(),
        )
            .into_response()),
        Err(err) => {
            tracing::warn!(
                request_id = %request_id,
                error = %err,
                "attestation verification failed"
            );
            Err(ApiErrorWithRequestId {
                error: err.into(),
                request_id,
            })
        }
    }
}
