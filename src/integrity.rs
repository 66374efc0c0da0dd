//! Streaming integrity verifier (C9): re-reads a stored object and compares
//! its content hash against the one recorded at upload time, without ever
//! materializing the whole object in memory.

use std::sync::Arc;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::store::{ObjectStore, StoreError};
use crate::types::ContentHash;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("hash mismatch: expected {expected}, computed {computed}")]
    Mismatch {
        expected: ContentHash,
        computed: ContentHash,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct IntegrityVerifier {
    store: Arc<dyn ObjectStore>,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Stream `key` back from the store, hashing as it goes, and compare
    /// against `expected`. Opt-in per the admission path — not run on
    /// every upload by default.
    #[instrument(skip(self, expected))]
    pub async fn verify(&self, key: &str, expected: &ContentHash) -> Result<(), IntegrityError> {
        let mut stream = self.store.get_stream(key).await.map_err(|e| match e {
            StoreError::NotFound(k) => IntegrityError::NotFound(k),
            other => IntegrityError::Store(other),
        })?;

        let mut hasher = Sha256::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
        }
        let computed = hex::encode(hasher.finalize());

        if &computed != expected {
            warn!(key, expected, computed, "content hash mismatch on verification");
            return Err(IntegrityError::Mismatch {
                expected: expected.clone(),
                computed,
            });
        }

        info!(key, "integrity verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::filesystem::bytes_stream;
    use crate::store::FilesystemStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    async fn hash_of(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    #[tokio::test]
    async fn verify_succeeds_for_matching_content() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path().to_path_buf()).await.unwrap());
        store
            .put_stream("a.wav", bytes_stream(b"hello".to_vec()), Some(5), None, &HashMap::new())
            .await
            .unwrap();

        let verifier = IntegrityVerifier::new(store);
        let hash = hash_of(b"hello").await;
        verifier.verify("a.wav", &hash).await.unwrap();
    }

    #[tokio::test]
    async fn verify_fails_for_tampered_content() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path().to_path_buf()).await.unwrap());
        store
            .put_stream("a.wav", bytes_stream(b"hello".to_vec()), Some(5), None, &HashMap::new())
            .await
            .unwrap();

        let verifier = IntegrityVerifier::new(store);
        let err = verifier.verify("a.wav", &"wronghash".to_string()).await.unwrap_err();
        assert!(matches!(err, IntegrityError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn verify_reports_not_found_for_missing_object() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path().to_path_buf()).await.unwrap());
        let verifier = IntegrityVerifier::new(store);
        let err = verifier
            .verify("missing.wav", &"anything".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrityError::NotFound(_)));
    }
}
