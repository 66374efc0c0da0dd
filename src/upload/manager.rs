//! Resumable upload manager: session bookkeeping for multipart uploads.
//! Parts are never buffered in process memory — each part is a real object
//! in the backing store, uploaded directly by the client via a presigned
//! URL, and assembled server-side at completion through
//! `ObjectStore::copy_compose`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::store::{ObjectStat, ObjectStore, StoreError};
use crate::types::{part_object_key, ContentHash};

use super::session::{PartRecord, SessionId, SessionState, UploadSession};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no such upload session: {0}")]
    NotFound(String),

    #[error("session {0} is not active")]
    NotActive(String),

    #[error("part numbers must be requested in ascending order")]
    PartsOutOfOrder,

    #[error("part {0} was never requested for this session")]
    PartNotRequested(u32),

    #[error("at least one part is required to complete an upload")]
    NoParts,

    #[error("submitted parts do not cover exactly 1..={total_parts} (got {submitted} parts)")]
    IncompletePartSet { total_parts: u32, submitted: u32 },

    #[error("etag mismatch on part {0}: client and store disagree on what was written")]
    EtagMismatch(u32),

    #[error("assembled size {size} exceeds the session's declared maximum {max}")]
    TooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct UploadManagerConfig {
    pub max_object_size: u64,
    pub presigned_ttl: Duration,
    pub max_idle: chrono::Duration,
}

pub struct UploadManager {
    sessions: RwLock<HashMap<SessionId, UploadSession>>,
    id_counter: AtomicU64,
    store: Arc<dyn ObjectStore>,
    config: UploadManagerConfig,
}

impl UploadManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadManagerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            id_counter: AtomicU64::new(0),
            store,
            config,
        }
    }

    fn mint_session_id(&self, object_key: &str) -> SessionId {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(object_key.as_bytes());
        let digest = hasher.finalize();
        SessionId(hex::encode(&digest[..16]))
    }

    #[instrument(skip(self, user_metadata))]
    pub fn init(
        &self,
        object_key: &str,
        declared_size: u64,
        content_type: Option<String>,
        user_metadata: HashMap<String, String>,
        expected_hash: Option<ContentHash>,
        total_parts: u32,
    ) -> Result<SessionId, UploadError> {
        if declared_size > self.config.max_object_size {
            return Err(UploadError::TooLarge {
                size: declared_size,
                max: self.config.max_object_size,
            });
        }

        let id = self.mint_session_id(object_key);
        let now = Utc::now();
        let session = UploadSession {
            id: id.clone(),
            object_key: object_key.to_string(),
            declared_size,
            content_type,
            user_metadata,
            expected_hash,
            state: SessionState::Active,
            parts: Default::default(),
            total_parts: total_parts.max(1),
            created_at: now,
            last_activity_at: now,
        };

        self.sessions.write().insert(id.clone(), session);
        info!(session_id = %id, object_key, declared_size, "upload session opened");
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn part_upload_url(
        &self,
        session_id: &SessionId,
        part_number: u32,
    ) -> Result<String, UploadError> {
        let object_key = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::NotFound(session_id.0.clone()))?;

            if session.state != SessionState::Active {
                return Err(UploadError::NotActive(session_id.0.clone()));
            }

            session.touch();
            session.parts.insert(
                part_number,
                PartRecord {
                    requested_at: Utc::now(),
                    etag: None,
                },
            );
            session.object_key.clone()
        };

        let part_key = part_object_key(&object_key, part_number);
        let url = self
            .store
            .presigned_put(&part_key, self.config.presigned_ttl)
            .await?;
        Ok(url)
    }

    /// Assemble the session's parts into the final object. Idempotent: a
    /// second call against an already-`Completed` session is a no-op that
    /// returns the same result without re-running `copy_compose`.
    ///
    /// `submitted` must name exactly the set `{1..=total_parts}` — a strict
    /// subset silently composing a truncated object is rejected rather than
    /// accepted. Each submitted etag is checked against the part object the
    /// store actually holds before composition proceeds.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        session_id: &SessionId,
        submitted: &[(u32, String)],
    ) -> Result<ObjectStat, UploadError> {
        if submitted.is_empty() {
            return Err(UploadError::NoParts);
        }
        for window in submitted.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(UploadError::PartsOutOfOrder);
            }
        }

        let (object_key, total_parts, part_keys, user_metadata) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::NotFound(session_id.0.clone()))?;

            if session.state == SessionState::Completed {
                // Re-stat the object so a retried client still gets a result.
                drop(sessions);
                let stat = self.store.stat(&self.sessions_object_key(session_id)?).await?;
                return stat.ok_or_else(|| UploadError::NotFound(session_id.0.clone()));
            }
            if session.state != SessionState::Active {
                return Err(UploadError::NotActive(session_id.0.clone()));
            }

            let submitted_numbers: Vec<u32> = submitted.iter().map(|(n, _)| *n).collect();
            let expected_count = session.total_parts;
            let covers_exactly = submitted_numbers.len() as u32 == expected_count
                && submitted_numbers
                    .iter()
                    .enumerate()
                    .all(|(i, n)| *n == i as u32 + 1);
            if !covers_exactly {
                return Err(UploadError::IncompletePartSet {
                    total_parts: expected_count,
                    submitted: submitted_numbers.len() as u32,
                });
            }

            for part_number in &submitted_numbers {
                if !session.parts.contains_key(part_number) {
                    return Err(UploadError::PartNotRequested(*part_number));
                }
            }

            session.state = SessionState::Completing;
            let keys = session
                .part_keys_in_order(&submitted_numbers)
                .into_iter()
                .map(|(_, key)| key)
                .collect::<Vec<_>>();
            (session.object_key.clone(), session.total_parts, keys, session.user_metadata.clone())
        };
        debug_assert_eq!(part_keys.len() as u32, total_parts);

        for ((part_number, claimed_etag), part_key) in submitted.iter().zip(part_keys.iter()) {
            let stat = match self.store.stat(part_key).await {
                Ok(Some(stat)) => stat,
                Ok(None) => {
                    self.rollback_to_active(session_id);
                    return Err(UploadError::PartNotRequested(*part_number));
                }
                Err(err) => {
                    self.rollback_to_active(session_id);
                    return Err(UploadError::Store(err));
                }
            };

            if let Some(actual_etag) = &stat.etag {
                if actual_etag != claimed_etag {
                    self.rollback_to_active(session_id);
                    return Err(UploadError::EtagMismatch(*part_number));
                }
            }

            let mut sessions = self.sessions.write();
            if let Some(session) = sessions.get_mut(session_id) {
                if let Some(record) = session.parts.get_mut(part_number) {
                    record.etag = Some(claimed_etag.clone());
                }
            }
        }

        match self.store.copy_compose(&object_key, &part_keys, &user_metadata).await {
            Ok(stat) => {
                if stat.size > self.config.max_object_size {
                    warn!(session_id = %session_id, size = stat.size, "assembled object exceeds declared maximum");
                }
                let mut sessions = self.sessions.write();
                if let Some(session) = sessions.get_mut(session_id) {
                    session.state = SessionState::Completed;
                    session.touch();
                }
                info!(session_id = %session_id, object_key, size = stat.size, "upload session completed");
                Ok(stat)
            }
            Err(err) => {
                self.rollback_to_active(session_id);
                Err(UploadError::Store(err))
            }
        }
    }

    fn rollback_to_active(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(session_id) {
            if session.state == SessionState::Completing {
                session.state = SessionState::Active;
            }
        }
    }

    fn sessions_object_key(&self, session_id: &SessionId) -> Result<String, UploadError> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.object_key.clone())
            .ok_or_else(|| UploadError::NotFound(session_id.0.clone()))
    }

    /// Abort an upload session, deleting any part objects already written.
    /// Idempotent: aborting an already-`Aborted` session is a no-op.
    #[instrument(skip(self))]
    pub async fn abort(&self, session_id: &SessionId) -> Result<(), UploadError> {
        let (object_key, already_done) = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| UploadError::NotFound(session_id.0.clone()))?;

            if session.state.is_terminal() {
                (session.object_key.clone(), true)
            } else {
                session.state = SessionState::Aborted;
                (session.object_key.clone(), false)
            }
        };

        if !already_done {
            let prefix = format!("{object_key}.part");
            let deleted = self.store.delete_prefix(&prefix).await?;
            info!(session_id = %session_id, deleted, "upload session aborted");
        }
        Ok(())
    }

    pub fn status(&self, session_id: &SessionId) -> Result<UploadSession, UploadError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(session_id.0.clone()))
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.state == SessionState::Active)
            .count()
    }

    /// Sweep sessions idle longer than `max_idle`, marking them `Expired`
    /// and cleaning up any orphaned part objects. Returns the count swept.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(SessionId, String)> = {
            let mut sessions = self.sessions.write();
            let mut found = Vec::new();
            for (id, session) in sessions.iter_mut() {
                if session.state == SessionState::Active
                    && session.idle_for(now) > self.config.max_idle
                {
                    session.state = SessionState::Expired;
                    found.push((id.clone(), session.object_key.clone()));
                }
            }
            found
        };

        for (id, object_key) in &expired {
            let prefix = format!("{object_key}.part");
            if let Err(err) = self.store.delete_prefix(&prefix).await {
                warn!(session_id = %id, error = %err, "failed to clean up expired session parts");
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "swept expired upload sessions");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilesystemStore;
    use tempfile::tempdir;

    async fn manager_with_tempdir() -> (UploadManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf()).await.unwrap();
        let manager = UploadManager::new(
            Arc::new(store),
            UploadManagerConfig {
                max_object_size: 1024 * 1024 * 1024,
                presigned_ttl: Duration::from_secs(900),
                max_idle: chrono::Duration::hours(2),
            },
        );
        (manager, dir)
    }

    #[tokio::test]
    async fn full_session_lifecycle_completes() {
        let (manager, dir) = manager_with_tempdir().await;
        let id = manager
            .init("sermon.wav", 6, None, HashMap::new(), None, 2)
            .unwrap();

        let url1 = manager.part_upload_url(&id, 1).await.unwrap();
        let url2 = manager.part_upload_url(&id, 2).await.unwrap();

        let path1 = url1.trim_start_matches("file://");
        let path2 = url2.trim_start_matches("file://");
        tokio::fs::write(path1, b"AAA").await.unwrap();
        tokio::fs::write(path2, b"BBB").await.unwrap();

        let parts = vec![(1, "e1".to_string()), (2, "e2".to_string())];
        let stat = manager.complete(&id, &parts).await.unwrap();
        assert_eq!(stat.size, 6);

        let status = manager.status(&id).unwrap();
        assert_eq!(status.state, SessionState::Completed);
        drop(dir);
    }

    #[tokio::test]
    async fn complete_rejects_out_of_order_parts() {
        let (manager, _dir) = manager_with_tempdir().await;
        let id = manager
            .init("a.wav", 10, None, HashMap::new(), None, 2)
            .unwrap();
        manager.part_upload_url(&id, 1).await.unwrap();
        manager.part_upload_url(&id, 2).await.unwrap();

        let parts = vec![(2, "e2".to_string()), (1, "e1".to_string())];
        let err = manager.complete(&id, &parts).await.unwrap_err();
        assert!(matches!(err, UploadError::PartsOutOfOrder));
    }

    #[tokio::test]
    async fn complete_rejects_unrequested_part() {
        let (manager, _dir) = manager_with_tempdir().await;
        let id = manager
            .init("a.wav", 10, None, HashMap::new(), None, 2)
            .unwrap();
        manager.part_upload_url(&id, 1).await.unwrap();

        let parts = vec![(1, "e1".to_string()), (5, "e5".to_string())];
        let err = manager.complete(&id, &parts).await.unwrap_err();
        assert!(matches!(err, UploadError::IncompletePartSet { .. }));
    }

    #[tokio::test]
    async fn complete_rejects_a_declared_part_that_was_never_requested() {
        let (manager, _dir) = manager_with_tempdir().await;
        let id = manager
            .init("a.wav", 10, None, HashMap::new(), None, 2)
            .unwrap();
        manager.part_upload_url(&id, 1).await.unwrap();

        let parts = vec![(1, "e1".to_string()), (2, "e2".to_string())];
        let err = manager.complete(&id, &parts).await.unwrap_err();
        assert!(matches!(err, UploadError::PartNotRequested(2)));
    }

    #[tokio::test]
    async fn complete_rejects_a_strict_subset_of_the_declared_parts() {
        let (manager, _dir) = manager_with_tempdir().await;
        let id = manager
            .init("a.wav", 10, None, HashMap::new(), None, 3)
            .unwrap();
        manager.part_upload_url(&id, 1).await.unwrap();
        manager.part_upload_url(&id, 2).await.unwrap();
        manager.part_upload_url(&id, 3).await.unwrap();

        let parts = vec![(1, "e1".to_string()), (2, "e2".to_string())];
        let err = manager.complete(&id, &parts).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::IncompletePartSet {
                total_parts: 3,
                submitted: 2
            }
        ));
        assert_eq!(manager.status(&id).unwrap().state, SessionState::Active);
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let (manager, _dir) = manager_with_tempdir().await;
        let id = manager
            .init("a.wav", 10, None, HashMap::new(), None, 1)
            .unwrap();
        manager.abort(&id).await.unwrap();
        manager.abort(&id).await.unwrap();
        assert_eq!(manager.status(&id).unwrap().state, SessionState::Aborted);
    }

    #[tokio::test]
    async fn sweep_expired_marks_idle_sessions() {
        let (manager, _dir) = manager_with_tempdir().await;
        let id = manager
            .init("a.wav", 10, None, HashMap::new(), None, 1)
            .unwrap();
        {
            let mut sessions = manager.sessions.write();
            let session = sessions.get_mut(&id).unwrap();
            session.last_activity_at = Utc::now() - chrono::Duration::hours(3);
        }

        let swept = manager.sweep_expired().await;
        assert_eq!(swept, 1);
        assert_eq!(manager.status(&id).unwrap().state, SessionState::Expired);
    }
}
