//! Object-store abstraction: the one narrow trait every other component
//! depends on instead of talking to S3 directly.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an `ObjectStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk full")]
    DiskFull,

    #[error("object too large: {size} bytes (max {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("upstream store error: {0}")]
    Backend(String),

    #[error("upstream store unreachable: {0}")]
    Unreachable(String),

    #[error("no such multipart upload: {0}")]
    NoSuchUpload(String),
}

impl StoreError {
    /// Whether a failed operation is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Backend(_) | StoreError::Unreachable(_) | StoreError::DiskFull
        )
    }
}

/// Metadata about a stored object, as returned by `stat` and `list_with_metadata`.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub user_metadata: HashMap<String, String>,
}

/// Handle identifying an in-progress multipart upload at the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUploadId(pub String);

/// One completed part, as reported back by the store after an upload.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Abstraction over the backing object store (S3/MinIO in production, a
/// local filesystem double in tests). Every method is expressed in terms
/// this service actually needs — no passthrough of the full S3 API surface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// HEAD-equivalent: existence and metadata without reading the body.
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>, StoreError>;

    /// Stream an object's full body into the store at `key`, replacing any
    /// existing object. `user_metadata` is attached as store-side metadata.
    async fn put_stream(
        &self,
        key: &str,
        body: BoxStream<'static, std::io::Result<Bytes>>,
        content_length: Option<u64>,
        content_type: Option<&str>,
        user_metadata: &HashMap<String, String>,
    ) -> Result<ObjectStat, StoreError>;

    /// Stream an object's body back for integrity verification or proxying.
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StoreError>>, StoreError>;

    /// List objects under `prefix`, including per-object user metadata —
    /// the only call the hash index hydration path is allowed to make.
    async fn list_with_metadata(&self, prefix: &str) -> Result<Vec<ObjectStat>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every object under `prefix` (used by the janitor to clean up
    /// orphaned part objects from an aborted or expired session).
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Server-side compose: assemble `dest` out of previously uploaded part
    /// objects, in order, without reading their bytes through this process.
    async fn copy_compose(
        &self,
        dest_key: &str,
        part_keys: &[String],
        user_metadata: &HashMap<String, String>,
    ) -> Result<ObjectStat, StoreError>;

    /// Mint a presigned PUT URL a client can upload directly to.
    async fn presigned_put(&self, key: &str, expires_in: Duration) -> Result<String, StoreError>;

    /// Begin a store-native multipart upload (used when composing from real
    /// multipart parts rather than whole objects, for very large single
    /// objects the admission controller routes through multipart directly).
    async fn multipart_init(&self, key: &str) -> Result<MultipartUploadId, StoreError>;

    /// Presigned URL for a single part of an in-progress multipart upload.
    async fn multipart_presigned_part(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
        part_number: u32,
        expires_in: Duration,
    ) -> Result<String, StoreError>;

    async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
        parts: &[CompletedPart],
    ) -> Result<ObjectStat, StoreError>;

    async fn multipart_abort(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
    ) -> Result<(), StoreError>;

    /// Lightweight connectivity check for readiness probes.
    async fn test_reachability(&self) -> Result<(), StoreError>;
}
