//! API error handling module
//!
//! Defines error types and their HTTP response conversions.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::services::pinning::StoreError;
use crate::services::VerifyError;
use crate::types::ApiErrorResponse;

/// Stable machine-readable error codes.
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const ATTESTATION_FAILED: &str = "ATTESTATION_FAILED";
    pub const STORE_BUSY: &str = "STORE_BUSY";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const TOO_MANY_REQUESTS: &str = "TOO_MANY_REQUESTS";
}

/// API error type with associated HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Too many requests")]
    TooManyRequests,
}

impl ApiError {
    /// Returns the error code for this error type.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => codes::VALIDATION_ERROR,
            ApiError::Verification(VerifyError::Store(StoreError::Busy)) => codes::STORE_BUSY,
            ApiError::Verification(VerifyError::Store(_)) | ApiError::Database(_) => {
                codes::INTERNAL_ERROR
            }
            ApiError::Verification(_) => codes::ATTESTATION_FAILED,
            ApiError::TooManyRequests => codes::TOO_MANY_REQUESTS,
        }
    }

    /// Returns the HTTP status code for this error type.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Verification(VerifyError::Store(StoreError::Busy)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Verification(VerifyError::Store(_)) | ApiError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Verification(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Returns a safe message for external consumption (no internal details).
    pub fn safe_message(&self) -> String {
        match self {
            // Verification failures carry fixed, operator-facing messages.
            ApiError::Verification(VerifyError::Store(StoreError::Busy)) => {
                "attestation store is busy".to_string()
            }
            ApiError::Verification(VerifyError::Store(_)) => {
                "an attestation store error occurred".to_string()
            }
            ApiError::Verification(err) => err.to_string(),
            ApiError::Validation(msg) => format!("Validation error: {msg}"),
            ApiError::Database(_) => "A database error occurred".to_string(),
            ApiError::TooManyRequests => {
                "Too many requests. Please wait before trying again.".to_string()
            }
        }
    }

    /// Converts the error to a response with the given request ID.
    pub fn into_response_with_request_id(self, request_id: Uuid) -> Response {
        let status = self.status_code();
        let body = ApiErrorResponse::new(self.code(), self.safe_message(), request_id);

        (status, Json(body)).into_response()
    }
}

/// A wrapper that carries the request ID with an error for response generation.
pub struct ApiErrorWithRequestId {
    pub error: ApiError,
    pub request_id: Uuid,
}

impl IntoResponse for ApiErrorWithRequestId {
    fn into_response(self) -> Response {
        self.error.into_response_with_request_id(self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::codec::DecodeError;
    use crate::services::policy::PolicyError;

    #[test]
    fn verification_failures_are_bad_requests() {
        let error = ApiError::Verification(VerifyError::Policy(PolicyError::ChallengeNotPending));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.code(), codes::ATTESTATION_FAILED);
        assert_eq!(error.safe_message(), "challenge is not pending");
    }

    #[test]
    fn decode_failures_keep_fixed_messages() {
        let error = ApiError::Verification(VerifyError::Decode(DecodeError::ChainTooLarge));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            error.safe_message(),
            "certificate chain exceeds the decompression budget"
        );
    }

    #[test]
    fn busy_store_maps_to_service_unavailable() {
        let error = ApiError::Verification(VerifyError::Store(StoreError::Busy));
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), codes::STORE_BUSY);
    }

    #[test]
    fn store_failures_do_not_leak_details() {
        let error = ApiError::Verification(VerifyError::Store(StoreError::Failure(
            sqlx::Error::PoolClosed,
        )));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.safe_message(), "an attestation store error occurred");
    }
}
