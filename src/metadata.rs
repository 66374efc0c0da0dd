//! Metadata recorder (C7): writes a sidecar `FileMetadata` record alongside
//! every stored object as a `.meta.json` file. Best-effort and off the
//! data path — its failure must never fail the upload that triggered it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream;
use tracing::{error, instrument};

use crate::store::ObjectStore;
use crate::types::FileMetadata;

fn sidecar_key(object_key: &str) -> String {
    format!("{object_key}.meta.json")
}

pub struct MetadataRecorder {
    store: Arc<dyn ObjectStore>,
}

impl MetadataRecorder {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Persist `metadata` as a JSON sidecar object next to `key`. A failure
    /// here is logged, not propagated — the object itself is already
    /// durably stored and remains retrievable without its sidecar.
    #[instrument(skip(self, metadata))]
    pub async fn record(&self, key: &str, metadata: &FileMetadata) {
        let body = match serde_json::to_vec_pretty(metadata) {
            Ok(body) => body,
            Err(err) => {
                error!(key, error = %err, "failed to serialize sidecar metadata");
                return;
            }
        };
        let len = body.len() as u64;
        let stream: futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>> =
            Box::pin(stream::once(async move { Ok(bytes::Bytes::from(body)) }));

        if let Err(err) = self
            .store
            .put_stream(
                &sidecar_key(key),
                stream,
                Some(len),
                Some("application/json"),
                &HashMap::new(),
            )
            .await
        {
            error!(key, error = %err, "failed to persist sidecar metadata");
        }
    }

    /// Read back a previously recorded sidecar, if present.
    pub async fn read(&self, key: &str) -> Option<FileMetadata> {
        let mut stream = self.store.get_stream(&sidecar_key(key)).await.ok()?;
        let mut body = Vec::new();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.ok()?);
        }
        serde_json::from_slice(&body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::filesystem::bytes_stream;
    use crate::store::FilesystemStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn record_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path().to_path_buf()).await.unwrap());
        store
            .put_stream("a.wav", bytes_stream(b"hi".to_vec()), Some(2), None, &HashMap::new())
            .await
            .unwrap();

        let recorder = MetadataRecorder::new(store);
        let metadata = FileMetadata::new("a.wav", "deadbeef".into(), 2, None);
        recorder.record("a.wav", &metadata).await;

        let read_back = recorder.read("a.wav").await.unwrap();
        assert_eq!(read_back.file_hash, "deadbeef");
    }

    #[tokio::test]
    async fn read_returns_none_when_sidecar_is_missing() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path().to_path_buf()).await.unwrap());
        let recorder = MetadataRecorder::new(store);
        assert!(recorder.read("missing.wav").await.is_none());
    }
}
