//! File listing and integrity re-verification.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::IngestError;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub key: String,
    pub size: u64,
    #[serde(rename = "fileHash")]
    pub file_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileEntry>,
}

/// List every object the store holds, annotated with its indexed content
/// hash where known. Intended for dashboards, not paginated — callers with
/// very large buckets should prefer the store's own listing API directly.
#[instrument(skip(state))]
pub async fn list(State(state): State<Arc<AppState>>) -> Result<Json<FileListResponse>, IngestError> {
    let objects = state.store.list_with_metadata("").await?;
    let files = objects
        .into_iter()
        .filter(|o| !o.key.ends_with(".meta.json") && !o.key.contains(".part"))
        .map(|o| FileEntry {
            file_hash: o.user_metadata.get(crate::types::HASH_METADATA_KEY).cloned(),
            key: o.key,
            size: o.size,
        })
        .collect();

    Ok(Json(FileListResponse { files }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(rename = "expectedHash")]
    pub expected_hash: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
    pub expected: String,
    pub actual: String,
    pub size: u64,
}

#[instrument(skip(state, req))]
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, IngestError> {
    let stat = state
        .store
        .stat(&key)
        .await?
        .ok_or_else(|| IngestError::NotFound(key.clone()))?;

    let outcome = state.integrity.verify(&key, &req.expected_hash).await;

    if let Some(metrics) = &state.metrics {
        let label = if outcome.is_ok() { "match" } else { "mismatch" };
        metrics.integrity_verifications_total.with_label_values(&[label]).inc();
    }

    match outcome {
        Ok(()) => Ok(Json(VerifyResponse {
            verified: true,
            expected: req.expected_hash.clone(),
            actual: req.expected_hash,
            size: stat.size,
        })),
        Err(crate::integrity::IntegrityError::Mismatch { expected, computed }) => Ok(Json(VerifyResponse {
            verified: false,
            expected,
            actual: computed,
            size: stat.size,
        })),
        Err(other) => Err(other.into()),
    }
}
