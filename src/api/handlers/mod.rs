//! Composition root and shared handler plumbing.

pub mod admin;
pub mod files;
pub mod multipart;
pub mod status;
pub mod upload;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::admission::AdmissionThresholds;
use crate::config::Config;
use crate::index::HashIndex;
use crate::integrity::IntegrityVerifier;
use crate::memory::MemoryMonitor;
use crate::metadata::MetadataRecorder;
use crate::metrics::Metrics;
use crate::progress::ProgressBroadcaster;
use crate::store::ObjectStore;
use crate::upload::UploadManager;

/// Everything a handler needs, built once at boot and shared behind an
/// `Arc`. No component here holds a reference back to `AppState` itself —
/// wiring happens only at this one composition root.
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub index: Arc<HashIndex>,
    pub memory: Arc<MemoryMonitor>,
    pub uploads: Arc<UploadManager>,
    pub progress: Arc<ProgressBroadcaster>,
    pub metadata: Arc<MetadataRecorder>,
    pub integrity: Arc<IntegrityVerifier>,
    pub proxy_upload_permits: Arc<Semaphore>,
    pub config: Arc<Config>,
    pub metrics: Option<Arc<Metrics>>,
}

impl AppState {
    pub fn thresholds(&self) -> AdmissionThresholds {
        AdmissionThresholds {
            large_file_threshold_bytes: self.config.large_file_threshold_bytes,
            direct_threshold_bytes: self.config.direct_threshold_bytes,
            max_upload_bytes: self.config.max_upload_bytes,
        }
    }
}

/// Substitute the host of a presigned URL minted against the internal
/// store endpoint with the publicly reachable one, preserving path, query,
/// and signature bytes verbatim. Pure string substitution — never touches
/// the signed policy.
pub fn rewrite_presigned_host(url: &str, public_endpoint: Option<&str>) -> String {
    let Some(public) = public_endpoint else {
        return url.to_string();
    };
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let path_start = rest.find('/').unwrap_or(rest.len());
    let public = public.trim_end_matches('/');
    format!("{public}{}", &rest[path_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_host_preserving_path_and_query() {
        let url = "http://minio-internal:9000/wavegate/a.wav?X-Amz-Signature=abc";
        let rewritten = rewrite_presigned_host(url, Some("https://public.example.com"));
        assert_eq!(
            rewritten,
            "https://public.example.com/wavegate/a.wav?X-Amz-Signature=abc"
        );
    }

    #[test]
    fn leaves_url_unchanged_when_no_public_endpoint_configured() {
        let url = "http://minio-internal:9000/wavegate/a.wav";
        assert_eq!(rewrite_presigned_host(url, None), url);
    }
}
