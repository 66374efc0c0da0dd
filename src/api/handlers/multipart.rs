//! Resumable multipart upload session endpoints (C5), wrapping
//! `UploadManager` at the HTTP boundary.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::api::IngestError;
use crate::progress::ProgressEvent;
use crate::types::{validate_filename, FileMetadata, UploadMethod};
use crate::upload::{SessionId, SessionState};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub filename: String,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    #[serde(rename = "fileHash")]
    pub file_hash: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "totalParts")]
    pub total_parts: u32,
    #[serde(rename = "uploadMethod")]
    pub upload_method: UploadMethod,
}

#[instrument(skip(state))]
pub async fn init(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>, IngestError> {
    validate_filename(&req.filename).map_err(|e| IngestError::InvalidInput(e.to_string()))?;

    if let Some(hash) = &req.file_hash {
        if let Some(existing) = state.index.contains(hash) {
            return Err(IngestError::Duplicate {
                detail: format!("content already stored at {}", existing.key),
                existing_key: Some(existing.key),
            });
        }
    }

    if !state.config.allow_filename_overwrite {
        if let Some(existing_hash) = state.index.hash_for_key(&req.filename) {
            if req.file_hash.as_deref().is_some_and(|h| h != existing_hash) {
                return Err(IngestError::NameCollision {
                    detail: format!("{} already stored under a different content hash", req.filename),
                    existing_key: Some(req.filename.clone()),
                });
            }
        }
    }

    let chunk_size = state.config.multipart_chunk_bytes;
    let total_parts = req.file_size.div_ceil(chunk_size).max(1) as u32;

    let mut user_metadata = HashMap::new();
    if let Some(hash) = &req.file_hash {
        user_metadata.insert(crate::types::HASH_METADATA_KEY.to_string(), hash.clone());
    }

    let id = state
        .uploads
        .init(
            &req.filename,
            req.file_size,
            req.content_type,
            user_metadata,
            req.file_hash,
            total_parts,
        )
        .map_err(IngestError::from)?;

    Ok(Json(InitResponse {
        upload_id: id.0,
        chunk_size,
        total_parts,
        upload_method: UploadMethod::Multipart,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PartUrlQuery {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    #[serde(rename = "partNumber")]
    pub part_number: u32,
}

#[derive(Debug, Serialize)]
pub struct PartUrlResponse {
    #[serde(rename = "uploadUrl")]
    pub upload_url: String,
    #[serde(rename = "partNumber")]
    pub part_number: u32,
}

#[instrument(skip(state))]
pub async fn part_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PartUrlQuery>,
) -> Result<Json<PartUrlResponse>, IngestError> {
    let session_id = SessionId(query.upload_id);
    let url = state.uploads.part_upload_url(&session_id, query.part_number).await?;
    let url = super::rewrite_presigned_host(&url, state.config.public_store_endpoint.as_deref());

    if let Some(metrics) = &state.metrics {
        metrics.upload_parts_received_total.inc();
    }

    state.progress.publish(
        &session_id,
        ProgressEvent::PartReceived {
            session_id: session_id.0.clone(),
            part_number: query.part_number,
            bytes_so_far: 0,
            timestamp: Utc::now(),
        },
    );

    Ok(Json(PartUrlResponse {
        upload_url: url,
        part_number: query.part_number,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PartInput {
    #[serde(rename = "partNumber")]
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    pub parts: Vec<PartInput>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub success: bool,
    pub key: String,
    pub size: u64,
    #[serde(rename = "isDuplicate")]
    pub is_duplicate: bool,
}

#[instrument(skip(state, req))]
pub async fn complete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, IngestError> {
    let session_id = SessionId(req.upload_id);
    let session = state.uploads.status(&session_id)?;

    let parts: Vec<(u32, String)> = req
        .parts
        .into_iter()
        .map(|p| (p.part_number, p.etag))
        .collect();
    let stat = state.uploads.complete(&session_id, &parts).await?;

    if let Some(hash) = &session.expected_hash {
        if state.config.strict_integrity_verification {
            state.integrity.verify(&stat.key, hash).await?;
        }
    }

    let hash = session
        .expected_hash
        .clone()
        .or_else(|| stat.user_metadata.get(crate::types::HASH_METADATA_KEY).cloned())
        .unwrap_or_default();

    if !hash.is_empty() {
        if let Some(existing) = state.index.contains(&hash) {
            if existing.key != stat.key {
                state.store.delete(&stat.key).await?;
                if let Some(metrics) = &state.metrics {
                    metrics.index_dedup_hits_total.inc();
                }
                state.progress.publish(
                    &session_id,
                    ProgressEvent::Completed {
                        session_id: session_id.0.clone(),
                        total_bytes: stat.size,
                        timestamp: Utc::now(),
                    },
                );
                state.progress.retire(&session_id);
                return Ok(Json(CompleteResponse {
                    success: true,
                    key: existing.key,
                    size: existing.size,
                    is_duplicate: true,
                }));
            }
        }
        state.index.add(hash.clone(), stat.key.clone(), stat.size);
    }

    let metadata = FileMetadata::new(&session.object_key, hash, stat.size, session.content_type.clone());
    state.metadata.record(&stat.key, &metadata).await;

    if let Some(metrics) = &state.metrics {
        metrics.upload_sessions_completed_total.inc();
        metrics.upload_bytes_ingested_total.inc_by(stat.size);
    }

    state.progress.publish(
        &session_id,
        ProgressEvent::Completed {
            session_id: session_id.0.clone(),
            total_bytes: stat.size,
            timestamp: Utc::now(),
        },
    );
    state.progress.retire(&session_id);

    Ok(Json(CompleteResponse {
        success: true,
        key: stat.key,
        size: stat.size,
        is_duplicate: false,
    }))
}

#[instrument(skip(state))]
pub async fn abort(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<serde_json::Value>, IngestError> {
    let session_id = SessionId(upload_id);
    state.uploads.abort(&session_id).await?;

    if let Some(metrics) = &state.metrics {
        metrics.upload_sessions_aborted_total.inc();
    }

    state.progress.publish(
        &session_id,
        ProgressEvent::Aborted {
            session_id: session_id.0.clone(),
            reason: "client requested abort".to_string(),
            timestamp: Utc::now(),
        },
    );
    state.progress.retire(&session_id);

    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    pub key: String,
    #[serde(rename = "declaredSize")]
    pub declared_size: u64,
    pub state: SessionState,
    #[serde(rename = "partsReceived")]
    pub parts_received: usize,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: DateTime<Utc>,
}

#[instrument(skip(state))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResponse>, IngestError> {
    let session_id = SessionId(upload_id);
    let session = state.uploads.status(&session_id)?;

    Ok(Json(StatusResponse {
        upload_id: session.id.0,
        key: session.object_key,
        declared_size: session.declared_size,
        state: session.state,
        parts_received: session.parts.len(),
        created_at: session.created_at,
        last_activity_at: session.last_activity_at,
    }))
}
