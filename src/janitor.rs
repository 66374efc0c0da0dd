//! Janitor (C10): periodic background sweep of stale upload sessions,
//! also retiring the matching progress-broadcaster channel for each one
//! it expires.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::progress::ProgressBroadcaster;
use crate::upload::UploadManager;

pub struct Janitor {
    uploads: Arc<UploadManager>,
    progress: Arc<ProgressBroadcaster>,
    sweep_interval: Duration,
}

impl Janitor {
    pub fn new(
        uploads: Arc<UploadManager>,
        progress: Arc<ProgressBroadcaster>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            uploads,
            progress,
            sweep_interval,
        }
    }

    /// Run one sweep pass. Exposed separately from `run` so tests and an
    /// on-demand admin trigger don't need to wait for the timer.
    pub async fn sweep_once(&self) -> usize {
        self.uploads.sweep_expired().await
    }

    /// Background loop, spawned once at boot alongside the memory sampler.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            interval.tick().await;
            let swept = self.sweep_once().await;
            if swept > 0 {
                info!(swept, "janitor sweep complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FilesystemStore;
    use crate::upload::UploadManagerConfig;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn sweep_once_reports_zero_when_nothing_is_idle() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path().to_path_buf()).await.unwrap());
        let uploads = Arc::new(UploadManager::new(
            store,
            UploadManagerConfig {
                max_object_size: 1 << 30,
                presigned_ttl: Duration::from_secs(60),
                max_idle: chrono::Duration::hours(1),
            },
        ));
        uploads
            .init("a.wav", 10, None, HashMap::new(), None, 1)
            .unwrap();

        let progress = ProgressBroadcaster::new(8);
        let janitor = Janitor::new(uploads, progress, Duration::from_secs(60));
        assert_eq!(janitor.sweep_once().await, 0);
    }
}
