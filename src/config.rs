//! Configuration for the ingestion gateway.
//!
//! Precedence: an explicit config file path env var, then default file
//! locations, then environment variables, then built-in defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default)]
    pub store: StoreConfig,

    /// When set, objects are written under this local directory instead of
    /// the S3-compatible store in `store` — the filesystem double used for
    /// local development and tests.
    #[serde(default)]
    pub filesystem_root: Option<PathBuf>,

    /// Requests declaring a size above this threshold are routed direct or
    /// multipart instead of proxied through this process.
    #[serde(default = "default_large_file_threshold_bytes")]
    pub large_file_threshold_bytes: u64,

    /// Size above which a single-shot direct PUT is abandoned in favor of a
    /// multipart session. Distinct from `multipart_chunk_bytes`, which is
    /// the size of each part once a multipart session is chosen.
    #[serde(default = "default_direct_threshold_bytes")]
    pub direct_threshold_bytes: u64,

    /// Fixed size of each part in a multipart session, and the buffering
    /// threshold `S3Store::put_stream` uses before it switches from a
    /// single `put_object` to the store's multipart primitive.
    #[serde(default = "default_multipart_chunk_bytes")]
    pub multipart_chunk_bytes: u64,

    #[serde(default = "default_max_concurrent_proxy_uploads")]
    pub max_concurrent_proxy_uploads: usize,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    #[serde(default = "default_memory_warning_ratio")]
    pub memory_warning_ratio: f64,

    #[serde(default = "default_memory_critical_ratio")]
    pub memory_critical_ratio: f64,

    #[serde(default = "default_session_max_idle_hours")]
    pub session_max_idle_hours: u64,

    #[serde(default = "default_presigned_ttl_seconds")]
    pub presigned_ttl_seconds: u64,

    /// Seconds to keep draining in-flight proxy streams during shutdown
    /// before cancelling the rest.
    #[serde(default = "default_shutdown_drain_seconds")]
    pub shutdown_drain_seconds: u64,

    /// Publicly reachable endpoint to substitute into presigned URLs, if it
    /// differs from the endpoint this process uses to reach the store
    /// (e.g. an internal MinIO hostname vs. a public load balancer).
    #[serde(default)]
    pub public_store_endpoint: Option<String>,

    /// Require a passing integrity re-check at multipart completion. Off by
    /// default — see DESIGN.md for the tradeoff.
    #[serde(default)]
    pub strict_integrity_verification: bool,

    /// When a declared filename already names a stored object under a
    /// different content hash, admission rejects by default. Set this to
    /// allow the new upload to overwrite the existing key instead.
    #[serde(default)]
    pub allow_filename_overwrite: bool,

    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
}

/// Connection details for the S3-compatible backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Size of each part `S3Store::put_stream` uploads internally once a
    /// streamed body outgrows a single part. A body that fits within one
    /// part is sent as a single `put_object` instead.
    #[serde(default = "default_put_part_size_bytes")]
    pub put_part_size_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: default_bucket(),
            region: default_region(),
            force_path_style: default_force_path_style(),
            access_key_id: None,
            secret_access_key: None,
            put_part_size_bytes: default_put_part_size_bytes(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_bucket() -> String {
    "wavegate".to_string()
}

fn default_large_file_threshold_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_multipart_chunk_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_direct_threshold_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_put_part_size_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_concurrent_proxy_uploads() -> usize {
    2
}

fn default_max_upload_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

fn default_max_memory_mb() -> u64 {
    1800
}

fn default_memory_warning_ratio() -> f64 {
    0.80
}

fn default_memory_critical_ratio() -> f64 {
    0.95
}

fn default_session_max_idle_hours() -> u64 {
    24
}

fn default_presigned_ttl_seconds() -> u64 {
    3600
}

fn default_shutdown_drain_seconds() -> u64 {
    30
}

fn default_max_blocking_threads() -> usize {
    16
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store: StoreConfig::default(),
            filesystem_root: None,
            large_file_threshold_bytes: default_large_file_threshold_bytes(),
            direct_threshold_bytes: default_direct_threshold_bytes(),
            multipart_chunk_bytes: default_multipart_chunk_bytes(),
            max_concurrent_proxy_uploads: default_max_concurrent_proxy_uploads(),
            max_upload_bytes: default_max_upload_bytes(),
            max_memory_mb: default_max_memory_mb(),
            memory_warning_ratio: default_memory_warning_ratio(),
            memory_critical_ratio: default_memory_critical_ratio(),
            session_max_idle_hours: default_session_max_idle_hours(),
            presigned_ttl_seconds: default_presigned_ttl_seconds(),
            shutdown_drain_seconds: default_shutdown_drain_seconds(),
            public_store_endpoint: None,
            strict_integrity_verification: false,
            allow_filename_overwrite: false,
            max_blocking_threads: default_max_blocking_threads(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
            }
        }

        if let Ok(endpoint) = std::env::var("STORE_ENDPOINT") {
            config.store.endpoint = Some(endpoint);
        }
        if let Ok(bucket) = std::env::var("STORE_BUCKET") {
            config.store.bucket = bucket;
        }
        if let Ok(key) = std::env::var("STORE_ACCESS_KEY") {
            config.store.access_key_id = Some(key);
        }
        if let Ok(secret) = std::env::var("STORE_SECRET_KEY") {
            config.store.secret_access_key = Some(secret);
        }
        if let Ok(secure) = std::env::var("STORE_SECURE") {
            // path-style addressing is the MinIO-compatible default; a
            // "secure" (virtual-hosted) deployment turns it off.
            config.store.force_path_style = !(secure == "true" || secure == "1");
        }

        if let Ok(endpoint) = std::env::var("PUBLIC_STORE_ENDPOINT") {
            config.public_store_endpoint = Some(endpoint);
        }

        if let Ok(v) = std::env::var("LARGE_FILE_THRESHOLD_MB") {
            if let Ok(mb) = v.parse::<u64>() {
                config.large_file_threshold_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(v) = std::env::var("MULTIPART_CHUNK_MB") {
            if let Ok(mb) = v.parse::<u64>() {
                config.multipart_chunk_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(v) = std::env::var("DIRECT_THRESHOLD_MB") {
            if let Ok(mb) = v.parse::<u64>() {
                config.direct_threshold_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(v) = std::env::var("PUT_PART_SIZE_MB") {
            if let Ok(mb) = v.parse::<u64>() {
                config.store.put_part_size_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(v) = std::env::var("MAX_CONCURRENT_PROXY_UPLOADS") {
            if let Ok(parsed) = v.parse() {
                config.max_concurrent_proxy_uploads = parsed;
            }
        }

        if let Ok(v) = std::env::var("MAX_UPLOAD_BYTES") {
            if let Ok(parsed) = v.parse() {
                config.max_upload_bytes = parsed;
            }
        }

        if let Ok(v) = std::env::var("MAX_MEMORY_MB") {
            if let Ok(parsed) = v.parse() {
                config.max_memory_mb = parsed;
            }
        }

        if let Ok(v) = std::env::var("MEMORY_WARNING_RATIO") {
            if let Ok(parsed) = v.parse() {
                config.memory_warning_ratio = parsed;
            }
        }

        if let Ok(v) = std::env::var("MEMORY_CRITICAL_RATIO") {
            if let Ok(parsed) = v.parse() {
                config.memory_critical_ratio = parsed;
            }
        }

        if let Ok(v) = std::env::var("SESSION_MAX_IDLE_HOURS") {
            if let Ok(parsed) = v.parse() {
                config.session_max_idle_hours = parsed;
            }
        }

        if let Ok(v) = std::env::var("PRESIGNED_TTL_SECONDS") {
            if let Ok(parsed) = v.parse() {
                config.presigned_ttl_seconds = parsed;
            }
        }

        if let Ok(path) = std::env::var("WAVEGATE_FILESYSTEM_ROOT") {
            config.filesystem_root = Some(PathBuf::from(path));
        }

        if let Ok(v) = std::env::var("ALLOW_FILENAME_OVERWRITE") {
            config.allow_filename_overwrite = v == "true" || v == "1";
        }

        config
    }

    pub fn load() -> Self {
        if let Ok(path) = std::env::var("WAVEGATE_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &["wavegate.toml", "/etc/wavegate/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    pub fn presigned_ttl(&self) -> Duration {
        Duration::from_secs(self.presigned_ttl_seconds)
    }

    pub fn session_max_idle(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_max_idle_hours as i64)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),
}
