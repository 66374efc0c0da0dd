//! Ingestion gateway error taxonomy and JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::admission::RejectKind;
use crate::integrity::IntegrityError;
use crate::memory::MemorySample;
use crate::store::StoreError;
use crate::upload::UploadError;

/// Top-level error surfaced at the HTTP boundary, collapsing the per-layer
/// error enums from the store, upload, and integrity modules into one type.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("duplicate: {detail}")]
    Duplicate { detail: String, existing_key: Option<String> },

    #[error("name collision: {detail}")]
    NameCollision { detail: String, existing_key: Option<String> },

    #[error("insufficient memory")]
    InsufficientMemory { snapshot: MemorySample },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("transient store failure: {0}")]
    TransientStore(String),

    #[error("integrity check failed: expected {expected}, observed {observed}")]
    IntegrityFailed { expected: String, observed: String },

    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::InvalidInput(_) => "invalid_input",
            IngestError::Duplicate { .. } => "duplicate",
            IngestError::NameCollision { .. } => "name_collision",
            IngestError::InsufficientMemory { .. } => "insufficient_memory",
            IngestError::NotFound(_) => "not_found",
            IngestError::PreconditionFailed(_) => "precondition_failed",
            IngestError::TransientStore(_) => "transient_store",
            IngestError::IntegrityFailed { .. } => "integrity_failed",
            IngestError::Cancelled => "cancelled",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            IngestError::Duplicate { .. } => StatusCode::CONFLICT,
            IngestError::NameCollision { .. } => StatusCode::CONFLICT,
            IngestError::InsufficientMemory { .. } => StatusCode::INSUFFICIENT_STORAGE,
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            IngestError::TransientStore(_) => StatusCode::BAD_GATEWAY,
            IngestError::IntegrityFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::Cancelled => StatusCode::from_u16(499).unwrap(),
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            IngestError::Duplicate { detail, existing_key } => json!({
                "error": self.code(),
                "message": detail,
                "isDuplicate": true,
                "existingKey": existing_key,
            }),
            IngestError::NameCollision { detail, existing_key } => json!({
                "error": self.code(),
                "message": detail,
                "existingKey": existing_key,
            }),
            IngestError::InsufficientMemory { snapshot } => json!({
                "error": self.code(),
                "message": self.to_string(),
                "current_memory": {
                    "peak_rss_bytes": snapshot.peak_rss_bytes,
                    "pressure_level": snapshot.pressure.to_string(),
                },
            }),
            other => json!({
                "error": other.code(),
                "message": other.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => IngestError::NotFound(key),
            StoreError::PreconditionFailed(detail) => IngestError::PreconditionFailed(detail),
            other => IngestError::TransientStore(other.to_string()),
        }
    }
}

impl From<UploadError> for IngestError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound(id) => IngestError::NotFound(format!("upload session {id}")),
            UploadError::NotActive(id) => {
                IngestError::PreconditionFailed(format!("session {id} is not active"))
            }
            UploadError::PartsOutOfOrder => {
                IngestError::PreconditionFailed("parts must be in ascending order".to_string())
            }
            UploadError::PartNotRequested(n) => {
                IngestError::PreconditionFailed(format!("part {n} was never assigned a URL"))
            }
            UploadError::NoParts => IngestError::PreconditionFailed("parts list must not be empty".to_string()),
            UploadError::IncompletePartSet { total_parts, submitted } => IngestError::PreconditionFailed(
                format!("completion must cover exactly parts 1..={total_parts}, got {submitted} parts"),
            ),
            UploadError::EtagMismatch(n) => {
                IngestError::PreconditionFailed(format!("etag mismatch on part {n}"))
            }
            UploadError::TooLarge { size, max } => {
                IngestError::InvalidInput(format!("declared size {size} exceeds maximum {max}"))
            }
            UploadError::Store(store_err) => store_err.into(),
        }
    }
}

impl From<IntegrityError> for IngestError {
    fn from(err: IntegrityError) -> Self {
        match err {
            IntegrityError::NotFound(key) => IngestError::NotFound(key),
            IntegrityError::Mismatch { expected, computed } => IngestError::IntegrityFailed {
                expected,
                observed: computed,
            },
            IntegrityError::Store(store_err) => store_err.into(),
        }
    }
}

/// Turn an admission rejection into the HTTP-facing error, attaching
/// whatever extra context the caller already had in hand (the existing
/// key for a duplicate, the live memory snapshot for a shortfall).
pub fn rejection_to_error(
    kind: RejectKind,
    detail: String,
    existing_key: Option<String>,
    memory_snapshot: MemorySample,
) -> IngestError {
    match kind {
        RejectKind::TooLarge => IngestError::InvalidInput(detail),
        RejectKind::DuplicateContent => IngestError::Duplicate { detail, existing_key },
        RejectKind::NameCollision => IngestError::NameCollision { detail, existing_key },
        RejectKind::InsufficientMemory => IngestError::InsufficientMemory {
            snapshot: memory_snapshot,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_409() {
        let err = IngestError::Duplicate {
            detail: "x".to_string(),
            existing_key: Some("a.wav".to_string()),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn insufficient_memory_maps_to_507() {
        let err = IngestError::InsufficientMemory {
            snapshot: MemorySample {
                timestamp: chrono::Utc::now(),
                peak_rss_bytes: 1,
                pressure: crate::types::PressureLevel::Critical,
            },
        };
        assert_eq!(err.status_code(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[test]
    fn name_collision_maps_to_409() {
        let err = IngestError::NameCollision {
            detail: "x".to_string(),
            existing_key: Some("a.wav".to_string()),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(
            IngestError::NotFound("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
