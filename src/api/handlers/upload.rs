//! Admission and the two non-resumable upload routes: minting a presigned
//! PUT for a declared file, and the proxied streaming path for small files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::admission::{decide, AdmissionInput, Decision, RejectKind};
use crate::pipeline::{rechunk, DEFAULT_CHUNK_SIZE};
use crate::types::{validate_filename, FileMetadata, UploadMethod};

use super::{rewrite_presigned_host, AppState};
use crate::api::IngestError;

#[derive(Debug, Deserialize)]
pub struct PresignedRequest {
    pub filename: String,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    #[serde(rename = "fileHash")]
    pub file_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresignedResponse {
    pub success: bool,
    #[serde(rename = "isDuplicate")]
    pub is_duplicate: bool,
    #[serde(rename = "uploadUrl")]
    pub upload_url: Option<String>,
    #[serde(rename = "uploadMethod")]
    pub upload_method: UploadMethod,
    #[serde(rename = "isLargeFile")]
    pub is_large_file: bool,
    pub expires: DateTime<Utc>,
}

/// Bytes this process estimates it will need resident to service a given
/// declared size under the chosen route. Proxy uploads hold one scratch
/// buffer per concurrent slot; direct and multipart routes cost this
/// process nothing beyond bookkeeping, but a very large object is still
/// charged against the soft limit since a failed direct PUT commonly falls
/// back to the proxy route on retry.
fn estimated_memory_cost(state: &AppState, declared_size: u64) -> u64 {
    if declared_size > state.config.large_file_threshold_bytes {
        DEFAULT_CHUNK_SIZE as u64 * 4
    } else {
        DEFAULT_CHUNK_SIZE as u64 * state.config.max_concurrent_proxy_uploads as u64
    }
}

async fn decide_route(
    state: &AppState,
    filename: &str,
    declared_size: u64,
    declared_hash: Option<&str>,
) -> Result<(Decision, Option<String>), IngestError> {
    validate_filename(filename).map_err(|e| IngestError::InvalidInput(e.to_string()))?;

    let existing = declared_hash.and_then(|h| state.index.contains(h));
    let existing_key = existing.as_ref().map(|e| e.key.clone());
    let memory_admits = state.memory.can_admit(estimated_memory_cost(state, declared_size));

    let name_collision = !state.config.allow_filename_overwrite
        && state
            .index
            .hash_for_key(filename)
            .is_some_and(|existing_hash| declared_hash.is_some_and(|h| h != existing_hash));

    let decision = decide(
        &state.thresholds(),
        &AdmissionInput {
            declared_size,
            existing_hash_match: declared_hash.filter(|_| existing.is_some()),
            name_collision,
            memory_admits,
        },
    );

    Ok((decision, existing_key))
}

#[instrument(skip(state))]
pub async fn presigned(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresignedRequest>,
) -> Result<Json<PresignedResponse>, IngestError> {
    let (decision, existing_key) =
        decide_route(&state, &req.filename, req.file_size, req.file_hash.as_deref()).await?;

    if let Some(metrics) = &state.metrics {
        metrics.admission_decisions_total.with_label_values(&["presigned"]).inc();
    }

    match decision {
        Decision::Reject { kind, detail } => {
            if let Some(metrics) = &state.metrics {
                let reason = match kind {
                    RejectKind::TooLarge => "too_large",
                    RejectKind::InsufficientMemory => "insufficient_memory",
                    RejectKind::DuplicateContent => "duplicate_content",
                    RejectKind::NameCollision => "name_collision",
                };
                metrics.admission_rejections_total.with_label_values(&[reason]).inc();
            }
            Err(crate::api::errors::rejection_to_error(
                kind,
                detail,
                existing_key,
                state.memory.current(),
            ))
        }
        Decision::Admit { route } => {
            let is_large_file = req.file_size > state.config.large_file_threshold_bytes;
            let expires = Utc::now() + chrono::Duration::from_std(state.config.presigned_ttl()).unwrap();
            let upload_url = match route {
                UploadMethod::Proxy => Some(format!("/upload/proxy?filename={}", req.filename)),
                UploadMethod::DirectMinio => {
                    let url = state
                        .store
                        .presigned_put(&req.filename, state.config.presigned_ttl())
                        .await?;
                    Some(rewrite_presigned_host(&url, state.config.public_store_endpoint.as_deref()))
                }
                UploadMethod::Multipart => None,
            };

            info!(filename = %req.filename, route = %route, "upload admitted");
            Ok(Json(PresignedResponse {
                success: true,
                is_duplicate: false,
                upload_url,
                upload_method: route,
                is_large_file,
                expires,
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PresignedBatchRequest {
    pub files: Vec<PresignedRequest>,
}

#[derive(Debug, Serialize)]
pub struct PresignedBatchEntry {
    pub filename: String,
    pub success: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub result: Option<PresignedResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresignedBatchResponse {
    pub results: Vec<PresignedBatchEntry>,
}

const MAX_BATCH_SIZE: usize = 50;

/// Admit every file in the batch independently. A single bad entry never
/// fails the others — the response is always 200 with a per-file result.
#[instrument(skip(state, req), fields(count = req.files.len()))]
pub async fn presigned_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresignedBatchRequest>,
) -> Result<Json<PresignedBatchResponse>, IngestError> {
    if req.files.is_empty() {
        return Err(IngestError::InvalidInput("files must not be empty".to_string()));
    }
    if req.files.len() > MAX_BATCH_SIZE {
        return Err(IngestError::InvalidInput(format!(
            "batch of {} exceeds maximum of {MAX_BATCH_SIZE}",
            req.files.len()
        )));
    }

    let mut results = Vec::with_capacity(req.files.len());
    for file in req.files {
        let filename = file.filename.clone();
        let outcome = decide_route(&state, &file.filename, file.file_size, file.file_hash.as_deref()).await;

        let entry = match outcome {
            Err(err) => PresignedBatchEntry {
                filename,
                success: false,
                result: None,
                error: Some(err.to_string()),
            },
            Ok((Decision::Reject { detail, .. }, _)) => PresignedBatchEntry {
                filename,
                success: false,
                result: None,
                error: Some(detail),
            },
            Ok((Decision::Admit { route }, _)) => {
                let is_large_file = file.file_size > state.config.large_file_threshold_bytes;
                let expires = Utc::now() + chrono::Duration::from_std(state.config.presigned_ttl()).unwrap();
                let upload_url = match route {
                    UploadMethod::Proxy => Some(format!("/upload/proxy?filename={filename}")),
                    UploadMethod::DirectMinio => match state
                        .store
                        .presigned_put(&filename, state.config.presigned_ttl())
                        .await
                    {
                        Ok(url) => Some(rewrite_presigned_host(&url, state.config.public_store_endpoint.as_deref())),
                        Err(err) => {
                            results.push(PresignedBatchEntry {
                                filename: filename.clone(),
                                success: false,
                                result: None,
                                error: Some(err.to_string()),
                            });
                            continue;
                        }
                    },
                    UploadMethod::Multipart => None,
                };
                PresignedBatchEntry {
                    filename,
                    success: true,
                    result: Some(PresignedResponse {
                        success: true,
                        is_duplicate: false,
                        upload_url,
                        upload_method: route,
                        is_large_file,
                        expires,
                    }),
                    error: None,
                }
            }
        };
        results.push(entry);
    }

    Ok(Json(PresignedBatchResponse { results }))
}

#[derive(Debug, Deserialize)]
pub struct ProxyUploadQuery {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct ProxyUploadResponse {
    pub success: bool,
    pub key: String,
    #[serde(rename = "fileHash")]
    pub file_hash: String,
    pub size: u64,
    #[serde(rename = "isDuplicate")]
    pub is_duplicate: bool,
}

/// Stream the request body straight into the store, hashing inline as the
/// bytes pass through a fixed-size scratch buffer. Bounded by
/// `proxy_upload_permits` so the buffer never multiplies past what the
/// memory budget was sized for.
///
/// The content hash is only known once the body has fully drained, so
/// unlike the presigned routes the dedup check necessarily happens after
/// the object is already written. A post-hoc duplicate is resolved by
/// deleting the just-written copy and pointing the caller at the original.
#[instrument(skip(state, headers, body))]
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyUploadQuery>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<Json<ProxyUploadResponse>, IngestError> {
    validate_filename(&query.filename).map_err(|e| IngestError::InvalidInput(e.to_string()))?;

    let scratch_cost = DEFAULT_CHUNK_SIZE as u64 * state.config.max_concurrent_proxy_uploads as u64;
    if !state.memory.can_admit(scratch_cost) {
        return Err(IngestError::InsufficientMemory {
            snapshot: state.memory.current(),
        });
    }

    let _permit = state
        .proxy_upload_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| IngestError::Cancelled)?;

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let hasher = Arc::new(Mutex::new(Sha256::new()));
    let bytes_seen = Arc::new(AtomicU64::new(0));
    let hasher_tap = hasher.clone();
    let bytes_seen_tap = bytes_seen.clone();

    let raw: BoxStream<'static, std::io::Result<Bytes>> = Box::pin(
        body.into_data_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
    );
    let hashed: BoxStream<'static, std::io::Result<Bytes>> = Box::pin(raw.map(move |chunk| {
        if let Ok(ref bytes) = chunk {
            hasher_tap.lock().update(bytes);
            bytes_seen_tap.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        chunk
    }));
    let chunked = rechunk(hashed, DEFAULT_CHUNK_SIZE);

    state
        .store
        .put_stream(&query.filename, chunked, None, content_type.as_deref(), &HashMap::new())
        .await?;

    let file_hash = hex::encode(hasher.lock().clone().finalize());
    let size = bytes_seen.load(Ordering::Relaxed);

    if let Some(existing) = state.index.contains(&file_hash) {
        if existing.key != query.filename {
            state.store.delete(&query.filename).await?;
            if let Some(metrics) = &state.metrics {
                metrics.index_dedup_hits_total.inc();
            }
            info!(filename = %query.filename, existing_key = %existing.key, "proxy upload resolved to existing content");
            return Ok(Json(ProxyUploadResponse {
                success: true,
                key: existing.key,
                file_hash,
                size: existing.size,
                is_duplicate: true,
            }));
        }
    }

    let metadata = FileMetadata::new(&query.filename, file_hash.clone(), size, content_type);
    state.index.add(file_hash.clone(), query.filename.clone(), size);
    state.metadata.record(&query.filename, &metadata).await;

    if let Some(metrics) = &state.metrics {
        metrics.upload_bytes_ingested_total.inc_by(size);
    }

    info!(filename = %query.filename, size, "proxy upload complete");
    Ok(Json(ProxyUploadResponse {
        success: true,
        key: query.filename,
        file_hash,
        size,
        is_duplicate: false,
    }))
}
