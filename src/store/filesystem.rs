//! Filesystem-backed `ObjectStore`, used for local development and as the
//! store double in integration tests (no MinIO container required to
//! exercise routing and session logic).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::traits::{CompletedPart, MultipartUploadId, ObjectStat, ObjectStore, StoreError};

const ENOSPC: i32 = 28;

fn io_to_store_error(e: std::io::Error) -> StoreError {
    if e.raw_os_error() == Some(ENOSPC) {
        StoreError::DiskFull
    } else {
        StoreError::Io(e)
    }
}

async fn atomic_write(path: &Path, data: Vec<u8>) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Backend("path has no parent directory".into()))?
        .to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent).map_err(io_to_store_error)?;
        tmp.write_all(&data).map_err(io_to_store_error)?;
        tmp.as_file().sync_all().map_err(io_to_store_error)?;
        tmp.persist(&path).map_err(|e| io_to_store_error(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Backend(format!("spawn_blocking join failed: {e}")))?
}

fn meta_path(data_path: &Path) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(".meta.json");
    PathBuf::from(s)
}

/// Sidecar record of the user-metadata map, since a plain filesystem has no
/// object store metadata headers to attach directly.
#[derive(serde::Serialize, serde::Deserialize)]
struct MetaSidecar {
    user_metadata: HashMap<String, String>,
}

pub struct FilesystemStore {
    root: PathBuf,
    uploads: Mutex<HashMap<String, Vec<(u32, PathBuf)>>>,
}

impl FilesystemStore {
    pub async fn new(root: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&root).await.map_err(io_to_store_error)?;
        Ok(Self {
            root,
            uploads: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn read_user_metadata(&self, data_path: &Path) -> HashMap<String, String> {
        let meta_path = meta_path(data_path);
        match fs::read(&meta_path).await {
            Ok(bytes) => serde_json::from_slice::<MetaSidecar>(&bytes)
                .map(|m| m.user_metadata)
                .unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>, StoreError> {
        let path = self.path_for(key);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(ObjectStat {
                key: key.to_string(),
                size: meta.len(),
                etag: None,
                user_metadata: self.read_user_metadata(&path).await,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_to_store_error(e)),
        }
    }

    async fn put_stream(
        &self,
        key: &str,
        mut body: BoxStream<'static, std::io::Result<Bytes>>,
        content_length: Option<u64>,
        _content_type: Option<&str>,
        user_metadata: &HashMap<String, String>,
    ) -> Result<ObjectStat, StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_to_store_error)?;
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.map_err(StoreError::Io)?);
        }
        let size = buf.len() as u64;
        atomic_write(&path, buf.to_vec()).await?;

        let sidecar = MetaSidecar {
            user_metadata: user_metadata.clone(),
        };
        let sidecar_bytes = serde_json::to_vec(&sidecar)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        atomic_write(&meta_path(&path), sidecar_bytes).await?;

        debug!(key, size, "wrote object to filesystem store");

        Ok(ObjectStat {
            key: key.to_string(),
            size: content_length.unwrap_or(size),
            etag: None,
            user_metadata: user_metadata.clone(),
        })
    }

    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StoreError>>, StoreError> {
        let path = self.path_for(key);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StoreError::NotFound(key.to_string())
                } else {
                    io_to_store_error(e)
                }
            })?;

        let stream = ReaderStream::new(file).map(|r| r.map_err(StoreError::Io));
        Ok(Box::pin(stream))
    }

    async fn list_with_metadata(&self, prefix: &str) -> Result<Vec<ObjectStat>, StoreError> {
        let mut stats = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_to_store_error)? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json")
                    && path.to_string_lossy().ends_with(".meta.json")
                {
                    continue;
                }
                let file_type = entry.file_type().await.map_err(io_to_store_error)?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let key = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if !key.starts_with(prefix) {
                    continue;
                }
                if let Some(stat) = self.stat(&key).await? {
                    stats.push(stat);
                }
            }
        }

        Ok(stats)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_to_store_error(e)),
        }
        let _ = fs::remove_file(meta_path(&path)).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let stats = self.list_with_metadata(prefix).await?;
        let count = stats.len() as u64;
        for stat in stats {
            self.delete(&stat.key).await?;
        }
        Ok(count)
    }

    async fn copy_compose(
        &self,
        dest_key: &str,
        part_keys: &[String],
        user_metadata: &HashMap<String, String>,
    ) -> Result<ObjectStat, StoreError> {
        let dest_path = self.path_for(dest_key);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await.map_err(io_to_store_error)?;
        }

        let mut combined = Vec::new();
        for part_key in part_keys {
            let bytes = fs::read(self.path_for(part_key))
                .await
                .map_err(io_to_store_error)?;
            combined.extend_from_slice(&bytes);
        }
        let size = combined.len() as u64;
        atomic_write(&dest_path, combined).await?;

        let sidecar = MetaSidecar {
            user_metadata: user_metadata.clone(),
        };
        let sidecar_bytes =
            serde_json::to_vec(&sidecar).map_err(|e| StoreError::Backend(e.to_string()))?;
        atomic_write(&meta_path(&dest_path), sidecar_bytes).await?;

        for part_key in part_keys {
            self.delete(part_key).await?;
        }

        Ok(ObjectStat {
            key: dest_key.to_string(),
            size,
            etag: None,
            user_metadata: user_metadata.clone(),
        })
    }

    async fn presigned_put(&self, key: &str, _expires_in: Duration) -> Result<String, StoreError> {
        Ok(format!("file://{}", self.path_for(key).display()))
    }

    async fn multipart_init(&self, key: &str) -> Result<MultipartUploadId, StoreError> {
        let upload_id = format!("local-{}", uuid::Uuid::new_v4());
        self.uploads.lock().insert(upload_id.clone(), Vec::new());
        debug!(key, upload_id, "initialized local multipart upload");
        Ok(MultipartUploadId(upload_id))
    }

    async fn multipart_presigned_part(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
        part_number: u32,
        _expires_in: Duration,
    ) -> Result<String, StoreError> {
        let part_path = self.path_for(&format!("{key}.part{part_number}"));
        self.uploads
            .lock()
            .entry(upload_id.0.clone())
            .or_default()
            .push((part_number, part_path.clone()));
        Ok(format!("file://{}", part_path.display()))
    }

    async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
        parts: &[CompletedPart],
    ) -> Result<ObjectStat, StoreError> {
        let part_keys: Vec<String> = {
            let mut registered = self
                .uploads
                .lock()
                .remove(&upload_id.0)
                .ok_or_else(|| StoreError::NoSuchUpload(upload_id.0.clone()))?;
            registered.sort_by_key(|(n, _)| *n);
            registered
                .into_iter()
                .filter(|(n, _)| parts.iter().any(|p| p.part_number == *n))
                .map(|(n, _)| format!("{key}.part{n}"))
                .collect()
        };
        self.copy_compose(key, &part_keys, &HashMap::new()).await
    }

    async fn multipart_abort(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
    ) -> Result<(), StoreError> {
        if let Some(parts) = self.uploads.lock().remove(&upload_id.0) {
            for (n, _) in parts {
                self.delete(&format!("{key}.part{n}")).await?;
            }
        }
        Ok(())
    }

    async fn test_reachability(&self) -> Result<(), StoreError> {
        fs::metadata(&self.root).await.map_err(io_to_store_error)?;
        Ok(())
    }
}

/// Adapt an in-memory byte slice to the `BoxStream` shape `put_stream` takes,
/// used by tests that don't want to stand up a full async reader.
#[cfg(test)]
pub fn bytes_stream(data: Vec<u8>) -> BoxStream<'static, std::io::Result<Bytes>> {
    Box::pin(stream::once(async move { Ok(Bytes::from(data)) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_stat_round_trips_metadata() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf()).await.unwrap();
        let mut meta = HashMap::new();
        meta.insert("x-file-hash".to_string(), "abc123".to_string());

        store
            .put_stream(
                "sermon.wav",
                bytes_stream(b"hello world".to_vec()),
                Some(11),
                None,
                &meta,
            )
            .await
            .unwrap();

        let stat = store.stat("sermon.wav").await.unwrap().unwrap();
        assert_eq!(stat.size, 11);
        assert_eq!(stat.user_metadata.get("x-file-hash").unwrap(), "abc123");
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf()).await.unwrap();
        let err = store.get_stream("missing.wav").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn multipart_round_trip_composes_in_order() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf()).await.unwrap();
        let upload_id = store.multipart_init("big.wav").await.unwrap();

        for (n, chunk) in [(1u32, b"AAA".to_vec()), (2, b"BBB".to_vec())] {
            let part_path_url = store
                .multipart_presigned_part(
                    "big.wav",
                    &upload_id,
                    n,
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
            let path = part_path_url.trim_start_matches("file://");
            fs::write(path, &chunk).await.unwrap();
        }

        let parts = vec![
            CompletedPart { part_number: 1, etag: "e1".into() },
            CompletedPart { part_number: 2, etag: "e2".into() },
        ];
        let stat = store
            .multipart_complete("big.wav", &upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(stat.size, 6);

        let mut stream = store.get_stream("big.wav").await.unwrap();
        let mut combined = Vec::new();
        while let Some(chunk) = stream.next().await {
            combined.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(combined, b"AAABBB");
    }

    #[tokio::test]
    async fn delete_prefix_removes_all_matching_objects() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf()).await.unwrap();
        store
            .put_stream("session1.part1", bytes_stream(b"a".to_vec()), None, None, &HashMap::new())
            .await
            .unwrap();
        store
            .put_stream("session1.part2", bytes_stream(b"b".to_vec()), None, None, &HashMap::new())
            .await
            .unwrap();

        let deleted = store.delete_prefix("session1").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.stat("session1.part1").await.unwrap().is_none());
    }
}
