//! Operational endpoints: liveness, and a human-facing stats summary.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let reachable = state.store.test_reachability().await.is_ok();
    Json(HealthResponse {
        status: if reachable { "ok" } else { "degraded" },
    })
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(rename = "indexedObjects")]
    pub indexed_objects: usize,
    #[serde(rename = "activeUploadSessions")]
    pub active_upload_sessions: usize,
    #[serde(rename = "peakRssBytes")]
    pub peak_rss_bytes: u64,
    #[serde(rename = "memoryPressure")]
    pub memory_pressure: String,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let sample = state.memory.current();
    Json(StatsResponse {
        indexed_objects: state.index.size(),
        active_upload_sessions: state.uploads.active_count(),
        peak_rss_bytes: sample.peak_rss_bytes,
        memory_pressure: sample.pressure.to_string(),
    })
}
