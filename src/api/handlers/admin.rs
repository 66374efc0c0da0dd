//! Destructive administrative operations. Never reachable by accident —
//! every handler here requires an explicit confirmation token.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use crate::api::IngestError;

use super::AppState;

const CONFIRMATION_TOKEN: &str = "yes-delete-everything";

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub confirm: Option<String>,
}

/// Delete every object in the bucket and reset in-memory state. Guarded by
/// a confirmation query parameter rather than a request body, so the
/// intent is visible in access logs without having to log bodies.
pub async fn clear_bucket(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<serde_json::Value>, IngestError> {
    if query.confirm.as_deref() != Some(CONFIRMATION_TOKEN) {
        return Err(IngestError::InvalidInput(format!(
            "pass ?confirm={CONFIRMATION_TOKEN} to proceed"
        )));
    }

    let deleted = state.store.delete_prefix("").await?;
    state.index.clear();
    warn!(deleted, "bucket cleared via admin endpoint");

    Ok(Json(serde_json::json!({
        "success": true,
        "objectsDeleted": deleted,
    })))
}
