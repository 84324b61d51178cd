//! API request/response types
//!
//! Defines the standard JSON response envelope shared by all endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard API success response wrapper.
///
/// All successful JSON responses follow this format:
/// ```json
/// {
///   "data": { /* payload */ },
///   "meta": {
///     "request_id": "uuid",
///     "timestamp": "2026-08-01T10:00:00Z"
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub meta: Meta,
}

impl<T> ApiResponse<T> {
    /// Creates a new API response with the given data and request ID.
    pub fn new(data: T, request_id: Uuid) -> Self {
        Self {
            data,
            meta: Meta::new(request_id),
        }
    }
}

/// Standard API error response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ErrorBody,
    pub meta: Meta,
}

impl ApiErrorResponse {
    /// Creates a new error response.
    pub fn new(code: impl Into<String>, message: impl Into<String>, request_id: Uuid) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
            meta: Meta::new(request_id),
        }
    }
}

/// Error payload with a stable machine-readable code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Response metadata attached to every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl Meta {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
        }
    }
}
