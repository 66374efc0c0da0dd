//! S3/MinIO-backed `ObjectStore` implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, instrument};

use crate::config::StoreConfig;

use super::retry::{with_retry, RetryPolicy};
use super::traits::{CompletedPart, MultipartUploadId, ObjectStat, ObjectStore, StoreError};

pub struct S3Store {
    client: Client,
    bucket: String,
    retry_policy: RetryPolicy,
    put_part_size_bytes: u64,
}

impl S3Store {
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));

        if let Some(ref endpoint) = config.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        if let (Some(ref key_id), Some(ref secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(key_id, secret, None, None, "wavegate-config");
            config_loader = config_loader.credentials_provider(credentials);
        }

        let sdk_config = config_loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        let client = Client::from_conf(s3_config);

        debug!(bucket = %config.bucket, "S3Store initialized");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            retry_policy: RetryPolicy::default(),
            put_part_size_bytes: config.put_part_size_bytes,
        })
    }

    fn classify_sdk_error<E: std::fmt::Debug>(key: &str, err: SdkError<E>) -> StoreError {
        match &err {
            SdkError::ServiceError(svc) if svc.raw().status().as_u16() == 404 => {
                StoreError::NotFound(key.to_string())
            }
            SdkError::ServiceError(svc) if svc.raw().status().as_u16() == 412 => {
                StoreError::PreconditionFailed(key.to_string())
            }
            SdkError::ServiceError(svc) if svc.raw().status().as_u16() == 429 => {
                StoreError::Backend(format!("throttled: {err:?}"))
            }
            SdkError::ServiceError(svc) if svc.raw().status().is_client_error() => {
                StoreError::Backend(format!("client error: {err:?}"))
            }
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                StoreError::Unreachable(format!("{err:?}"))
            }
            _ => StoreError::Backend(format!("{err:?}")),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>, StoreError> {
        let result = with_retry(&self.retry_policy, || async {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::classify_sdk_error(key, e))
        })
        .await;

        match result {
            Ok(head) => {
                let mut user_metadata = HashMap::new();
                if let Some(meta) = head.metadata() {
                    for (k, v) in meta {
                        user_metadata.insert(k.clone(), v.clone());
                    }
                }
                Ok(Some(ObjectStat {
                    key: key.to_string(),
                    size: head.content_length().unwrap_or(0).max(0) as u64,
                    etag: head.e_tag().map(|s| s.trim_matches('"').to_string()),
                    user_metadata,
                }))
            }
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Stream the body in through this process in bounded `put_part_size_bytes`
    /// chunks rather than materializing it whole. A body that fits in a
    /// single part is sent as one `put_object`; anything larger falls back
    /// to the store's own multipart primitive, uploading one part at a time
    /// so peak memory stays at one part size regardless of object size.
    #[instrument(skip(self, body))]
    async fn put_stream(
        &self,
        key: &str,
        mut body: BoxStream<'static, std::io::Result<Bytes>>,
        content_length: Option<u64>,
        content_type: Option<&str>,
        user_metadata: &HashMap<String, String>,
    ) -> Result<ObjectStat, StoreError> {
        let part_size = self.put_part_size_bytes as usize;
        let mut buffer: Vec<u8> = Vec::with_capacity(part_size.min(8 * 1024 * 1024));
        let mut total_len: u64 = 0;
        let mut session: Option<(String, Vec<SdkCompletedPart>)> = None;

        loop {
            while buffer.len() < part_size {
                match body.next().await {
                    Some(chunk) => {
                        let chunk = chunk.map_err(StoreError::Io)?;
                        total_len += chunk.len() as u64;
                        buffer.extend_from_slice(&chunk);
                    }
                    None => break,
                }
            }
            let exhausted = buffer.len() < part_size;

            if session.is_none() && exhausted {
                let part_bytes = Bytes::from(std::mem::take(&mut buffer));
                let mut request = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(part_bytes.clone()));
                if let Some(ct) = content_type {
                    request = request.content_type(ct);
                }
                for (k, v) in user_metadata {
                    request = request.metadata(k, v);
                }

                let output = with_retry(&self.retry_policy, || {
                    let request = request.clone();
                    async move {
                        request
                            .send()
                            .await
                            .map_err(|e| Self::classify_sdk_error(key, e))
                    }
                })
                .await?;

                return Ok(ObjectStat {
                    key: key.to_string(),
                    size: content_length.unwrap_or(total_len),
                    etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
                    user_metadata: user_metadata.clone(),
                });
            }

            if session.is_none() {
                let mut create = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
                if let Some(ct) = content_type {
                    create = create.content_type(ct);
                }
                for (k, v) in user_metadata {
                    create = create.metadata(k, v);
                }
                let output = with_retry(&self.retry_policy, || {
                    let create = create.clone();
                    async move { create.send().await.map_err(|e| Self::classify_sdk_error(key, e)) }
                })
                .await?;
                let upload_id = output
                    .upload_id()
                    .ok_or_else(|| StoreError::Backend("missing upload id".into()))?
                    .to_string();
                session = Some((upload_id, Vec::new()));
            }

            let (upload_id, parts) = session.as_mut().expect("session initialized above");
            if !buffer.is_empty() {
                let part_number = parts.len() as i32 + 1;
                let part_bytes = Bytes::from(std::mem::take(&mut buffer));
                let upload_id_str = upload_id.clone();
                let request = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id_str)
                    .part_number(part_number)
                    .body(ByteStream::from(part_bytes.clone()));

                let output = with_retry(&self.retry_policy, || {
                    let request = request.clone();
                    async move {
                        request
                            .send()
                            .await
                            .map_err(|e| Self::classify_sdk_error(key, e))
                    }
                })
                .await?;

                let etag = output.e_tag().unwrap_or_default().trim_matches('"').to_string();
                parts.push(SdkCompletedPart::builder().part_number(part_number).e_tag(etag).build());
            }

            if exhausted {
                break;
            }
        }

        let (upload_id, parts) = session.expect("multipart session always started for a body over one part");
        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

        let output = with_retry(&self.retry_policy, || {
            let completed = completed.clone();
            let upload_id = upload_id.clone();
            async move {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| Self::classify_sdk_error(key, e))
            }
        })
        .await?;

        Ok(ObjectStat {
            key: key.to_string(),
            size: content_length.unwrap_or(total_len),
            etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
            user_metadata: user_metadata.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StoreError>>, StoreError> {
        let output = with_retry(&self.retry_policy, || async {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::classify_sdk_error(key, e))
        })
        .await?;

        let stream = output
            .body
            .into_async_read()
            .compat_stream()
            .map(|r| r.map_err(|e: std::io::Error| StoreError::Io(e)));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self))]
    async fn list_with_metadata(&self, prefix: &str) -> Result<Vec<ObjectStat>, StoreError> {
        let mut stats = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.clone() {
                request = request.continuation_token(token);
            }

            let response = with_retry(&self.retry_policy, || {
                let request = request.clone();
                async move {
                    request
                        .send()
                        .await
                        .map_err(|e| Self::classify_sdk_error(prefix, e))
                }
            })
            .await?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    if let Some(stat) = self.stat(key).await? {
                        stats.push(stat);
                    }
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        with_retry(&self.retry_policy, || async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::classify_sdk_error(key, e))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let stats = self.list_with_metadata(prefix).await?;
        let mut deleted = 0u64;
        for stat in stats {
            self.delete(&stat.key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    #[instrument(skip(self, part_keys, user_metadata))]
    async fn copy_compose(
        &self,
        dest_key: &str,
        part_keys: &[String],
        user_metadata: &HashMap<String, String>,
    ) -> Result<ObjectStat, StoreError> {
        let upload_id = self.multipart_init(dest_key).await?;

        let mut completed = Vec::with_capacity(part_keys.len());
        for (idx, source_key) in part_keys.iter().enumerate() {
            let part_number = (idx + 1) as i32;
            let copy_source = format!("{}/{}", self.bucket, source_key);

            let result = with_retry(&self.retry_policy, || {
                let copy_source = copy_source.clone();
                let upload_id = upload_id.0.clone();
                async move {
                    self.client
                        .upload_part_copy()
                        .bucket(&self.bucket)
                        .key(dest_key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .copy_source(copy_source)
                        .send()
                        .await
                        .map_err(|e| Self::classify_sdk_error(dest_key, e))
                }
            })
            .await?;

            let etag = result
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();

            completed.push(CompletedPart {
                part_number: part_number as u32,
                etag,
            });
        }

        let stat = self
            .multipart_complete(dest_key, &upload_id, &completed)
            .await?;

        for source_key in part_keys {
            let _ = self.delete(source_key).await;
        }

        debug!(dest_key, parts = completed.len(), "composed object from parts");
        let _ = user_metadata;
        Ok(stat)
    }

    #[instrument(skip(self))]
    async fn presigned_put(&self, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| Self::classify_sdk_error(key, e))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn multipart_init(&self, key: &str) -> Result<MultipartUploadId, StoreError> {
        let output = with_retry(&self.retry_policy, || async {
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::classify_sdk_error(key, e))
        })
        .await?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::Backend("missing upload id".into()))?
            .to_string();

        Ok(MultipartUploadId(upload_id))
    }

    #[instrument(skip(self))]
    async fn multipart_presigned_part(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
        part_number: u32,
        expires_in: Duration,
    ) -> Result<String, StoreError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id.0)
            .part_number(part_number as i32)
            .presigned(config)
            .await
            .map_err(|e| Self::classify_sdk_error(key, e))?;

        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self, parts))]
    async fn multipart_complete(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
        parts: &[CompletedPart],
    ) -> Result<ObjectStat, StoreError> {
        let sdk_parts: Vec<SdkCompletedPart> = parts
            .iter()
            .map(|p| {
                SdkCompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(sdk_parts))
            .build();

        let output = with_retry(&self.retry_policy, || {
            let completed = completed.clone();
            async move {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id.0)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| Self::classify_sdk_error(key, e))
            }
        })
        .await?;

        Ok(ObjectStat {
            key: key.to_string(),
            size: 0,
            etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
            user_metadata: HashMap::new(),
        })
    }

    #[instrument(skip(self))]
    async fn multipart_abort(
        &self,
        key: &str,
        upload_id: &MultipartUploadId,
    ) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id.0)
            .send()
            .await
            .map_err(|e| Self::classify_sdk_error(key, e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn test_reachability(&self) -> Result<(), StoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::classify_sdk_error(&self.bucket, e))?;
        Ok(())
    }
}

trait CompatStream {
    fn compat_stream(self) -> BoxStream<'static, std::io::Result<Bytes>>;
}

impl<R> CompatStream for R
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    fn compat_stream(self) -> BoxStream<'static, std::io::Result<Bytes>> {
        Box::pin(tokio_util::io::ReaderStream::new(self))
    }
}
