//! Ingestion gateway binary: wires configuration, the object store, and
//! every component into the composition root, then serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wavegate::admission::AdmissionThresholds;
use wavegate::api::handlers::{admin, files, multipart, status, upload, AppState};
use wavegate::config::Config;
use wavegate::index::HashIndex;
use wavegate::integrity::IntegrityVerifier;
use wavegate::janitor::Janitor;
use wavegate::memory::{MemoryMonitor, MemoryMonitorConfig};
use wavegate::metadata::MetadataRecorder;
use wavegate::metrics::{http_metrics_middleware, metrics_handler, Metrics};
use wavegate::progress::ProgressBroadcaster;
use wavegate::store::{FilesystemStore, ObjectStore, S3Store};
use wavegate::upload::{UploadManager, UploadManagerConfig};

fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| format!("{} (built {})", env!("CARGO_PKG_VERSION"), env!("WAVEGATE_BUILD_TIME")))
}

/// Memory-constrained ingestion gateway for very large audio objects.
#[derive(Parser, Debug)]
#[command(name = "wavegate")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Config is loaded here, before the tokio runtime exists, purely to
    // read max_blocking_threads — the runtime's blocking pool size has to
    // be fixed before the runtime is built.
    let pre_config = if let Some(ref path) = cli.config {
        Config::from_file(path).unwrap_or_else(|_| Config::load())
    } else {
        Config::load()
    };

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    runtime_builder.max_blocking_threads(pre_config.max_blocking_threads);
    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("wavegate=trace,tower_http=trace")
        } else {
            EnvFilter::new("wavegate=debug,tower_http=info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }
    let config = Arc::new(config);

    info!(version = env!("CARGO_PKG_VERSION"), built = env!("WAVEGATE_BUILD_TIME"), "starting wavegate");
    info!(addr = %config.listen_addr, "listen address");
    info!(
        large_file_threshold_mb = config.large_file_threshold_bytes / 1024 / 1024,
        max_memory_mb = config.max_memory_mb,
        "admission thresholds"
    );

    let store: Arc<dyn ObjectStore> = if let Some(root) = &config.filesystem_root {
        info!(root = %root.display(), "using filesystem store");
        Arc::new(FilesystemStore::new(root.clone()).await?)
    } else {
        info!(bucket = %config.store.bucket, endpoint = ?config.store.endpoint, "using S3-compatible store");
        Arc::new(S3Store::new(&config.store).await?)
    };
    store.test_reachability().await?;

    let index = Arc::new(HashIndex::new());
    let hydration = index.hydrate(store.as_ref()).await?;
    info!(entries = hydration.entries, skipped = hydration.skipped_unindexed, "hash index hydrated");

    let memory = MemoryMonitor::new(MemoryMonitorConfig {
        max_memory_bytes: config.max_memory_bytes(),
        warning_ratio: config.memory_warning_ratio,
        critical_ratio: config.memory_critical_ratio,
        sample_interval: Duration::from_secs(5),
    });
    tokio::spawn(memory.clone().run());

    let uploads = Arc::new(UploadManager::new(
        store.clone(),
        UploadManagerConfig {
            max_object_size: config.max_upload_bytes,
            presigned_ttl: config.presigned_ttl(),
            max_idle: config.session_max_idle(),
        },
    ));
    let progress = ProgressBroadcaster::new(64);
    let metadata = Arc::new(MetadataRecorder::new(store.clone()));
    let integrity = Arc::new(IntegrityVerifier::new(store.clone()));

    let janitor = Arc::new(Janitor::new(uploads.clone(), progress.clone(), Duration::from_secs(300)));
    tokio::spawn(janitor.run());

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    let store_type = if config.filesystem_root.is_some() { "filesystem" } else { "s3" };
    metrics.build_info.with_label_values(&[env!("CARGO_PKG_VERSION"), store_type]).set(1.0);

    let state = Arc::new(AppState {
        store,
        index,
        memory,
        uploads,
        progress,
        metadata,
        integrity,
        proxy_upload_permits: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent_proxy_uploads)),
        config: config.clone(),
        metrics: Some(metrics),
    });
    let _thresholds: AdmissionThresholds = state.thresholds();

    let app = Router::new()
        .route("/health", get(status::health))
        .route("/stats", get(status::stats))
        .route("/metrics", get(metrics_handler))
        .route("/upload/presigned", post(upload::presigned))
        .route("/upload/presigned-batch", post(upload::presigned_batch))
        .route("/upload/proxy", post(upload::proxy))
        .route("/multipart/init", post(multipart::init))
        .route("/multipart/part-url", get(multipart::part_url))
        .route("/multipart/complete", post(multipart::complete))
        .route("/multipart/abort/:upload_id", delete(multipart::abort))
        .route("/multipart/status/:upload_id", get(multipart::status))
        .route("/files", get(files::list))
        .route("/files/:key/verify", post(files::verify))
        .route("/bucket/clear", delete(admin::clear_bucket))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state.clone(), http_metrics_middleware))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes as usize))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "wavegate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.shutdown_drain_seconds))
        .await?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal(drain_seconds: u64) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C, draining for {drain_seconds}s before shutdown"),
        _ = terminate => warn!("received SIGTERM, draining for {drain_seconds}s before shutdown"),
    }
    tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
}
