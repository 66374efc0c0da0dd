//! Prometheus metrics for the ingestion gateway.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;

/// All Prometheus metrics for the gateway.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,
    pub process_peak_rss_bytes: Gauge,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_request_size_bytes: HistogramVec,
    pub http_response_size_bytes: HistogramVec,

    // -- Admission --
    pub admission_decisions_total: IntCounterVec,
    pub admission_rejections_total: IntCounterVec,

    // -- Hash Index --
    pub index_entries: Gauge,
    pub index_dedup_hits_total: IntCounter,

    // -- Memory Pressure --
    pub memory_pressure_level: GaugeVec,
    pub memory_admission_denials_total: IntCounter,

    // -- Uploads --
    pub upload_sessions_active: Gauge,
    pub upload_sessions_completed_total: IntCounter,
    pub upload_sessions_aborted_total: IntCounter,
    pub upload_sessions_expired_total: IntCounter,
    pub upload_parts_received_total: IntCounter,
    pub upload_bytes_ingested_total: IntCounter,

    // -- Integrity --
    pub integrity_verifications_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("wavegate_build_info", "Build information"),
            &["version", "store_type"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        let process_peak_rss_bytes = Gauge::new(
            "process_peak_rss_bytes",
            "Peak resident set size in bytes (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(process_peak_rss_bytes.clone()))
            .unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "wavegate_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let body_size_buckets = prometheus::exponential_buckets(1024.0, 10.0, 7).unwrap();
        // [1KB, 10KB, 100KB, 1MB, 10MB, 100MB, 1GB]

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "wavegate_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "wavegate_http_request_size_bytes",
                "HTTP request body size in bytes",
            )
            .buckets(body_size_buckets.clone()),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_size_bytes.clone()))
            .unwrap();

        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "wavegate_http_response_size_bytes",
                "HTTP response body size in bytes",
            )
            .buckets(body_size_buckets),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_response_size_bytes.clone()))
            .unwrap();

        // -- Admission --
        let admission_decisions_total = IntCounterVec::new(
            Opts::new(
                "wavegate_admission_decisions_total",
                "Admission decisions by chosen route",
            ),
            &["route"],
        )
        .unwrap();
        registry
            .register(Box::new(admission_decisions_total.clone()))
            .unwrap();

        let admission_rejections_total = IntCounterVec::new(
            Opts::new(
                "wavegate_admission_rejections_total",
                "Admission rejections by reason",
            ),
            &["reason"],
        )
        .unwrap();
        registry
            .register(Box::new(admission_rejections_total.clone()))
            .unwrap();

        // -- Hash Index --
        let index_entries = Gauge::new(
            "wavegate_index_entries",
            "Number of distinct content hashes tracked by the dedup index",
        )
        .unwrap();
        registry.register(Box::new(index_entries.clone())).unwrap();

        let index_dedup_hits_total = IntCounter::new(
            "wavegate_index_dedup_hits_total",
            "Total uploads short-circuited by a matching content hash",
        )
        .unwrap();
        registry
            .register(Box::new(index_dedup_hits_total.clone()))
            .unwrap();

        // -- Memory Pressure --
        let memory_pressure_level = GaugeVec::new(
            Opts::new(
                "wavegate_memory_pressure_level",
                "Current memory pressure level (1 = active level, 0 otherwise)",
            ),
            &["level"],
        )
        .unwrap();
        registry
            .register(Box::new(memory_pressure_level.clone()))
            .unwrap();

        let memory_admission_denials_total = IntCounter::new(
            "wavegate_memory_admission_denials_total",
            "Total uploads rejected due to memory pressure",
        )
        .unwrap();
        registry
            .register(Box::new(memory_admission_denials_total.clone()))
            .unwrap();

        // -- Uploads --
        let upload_sessions_active = Gauge::new(
            "wavegate_upload_sessions_active",
            "Currently active resumable upload sessions",
        )
        .unwrap();
        registry
            .register(Box::new(upload_sessions_active.clone()))
            .unwrap();

        let upload_sessions_completed_total = IntCounter::new(
            "wavegate_upload_sessions_completed_total",
            "Total resumable upload sessions completed",
        )
        .unwrap();
        registry
            .register(Box::new(upload_sessions_completed_total.clone()))
            .unwrap();

        let upload_sessions_aborted_total = IntCounter::new(
            "wavegate_upload_sessions_aborted_total",
            "Total resumable upload sessions aborted by the client",
        )
        .unwrap();
        registry
            .register(Box::new(upload_sessions_aborted_total.clone()))
            .unwrap();

        let upload_sessions_expired_total = IntCounter::new(
            "wavegate_upload_sessions_expired_total",
            "Total resumable upload sessions expired by the janitor",
        )
        .unwrap();
        registry
            .register(Box::new(upload_sessions_expired_total.clone()))
            .unwrap();

        let upload_parts_received_total = IntCounter::new(
            "wavegate_upload_parts_received_total",
            "Total multipart upload parts acknowledged",
        )
        .unwrap();
        registry
            .register(Box::new(upload_parts_received_total.clone()))
            .unwrap();

        let upload_bytes_ingested_total = IntCounter::new(
            "wavegate_upload_bytes_ingested_total",
            "Total bytes accepted across all ingestion routes",
        )
        .unwrap();
        registry
            .register(Box::new(upload_bytes_ingested_total.clone()))
            .unwrap();

        // -- Integrity --
        let integrity_verifications_total = IntCounterVec::new(
            Opts::new(
                "wavegate_integrity_verifications_total",
                "Integrity verification outcomes",
            ),
            &["outcome"],
        )
        .unwrap();
        registry
            .register(Box::new(integrity_verifications_total.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            process_peak_rss_bytes,
            http_requests_total,
            http_request_duration_seconds,
            http_request_size_bytes,
            http_response_size_bytes,
            admission_decisions_total,
            admission_rejections_total,
            index_entries,
            index_dedup_hits_total,
            memory_pressure_level,
            memory_admission_denials_total,
            upload_sessions_active,
            upload_sessions_completed_total,
            upload_sessions_aborted_total,
            upload_sessions_expired_total,
            upload_parts_received_total,
            upload_bytes_ingested_total,
            integrity_verifications_total,
        }
    }
}

/// Classify a request path into a bounded operation label for metrics.
pub fn classify_operation(method: &str, path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/stats" => return "stats",
        "/metrics" => return "metrics",
        "/bucket/clear" => return "bucket_clear",
        "/upload/presigned" => return "presigned",
        "/upload/presigned-batch" => return "presigned_batch",
        "/upload/proxy" => return "proxy_upload",
        _ => {}
    }

    if path.starts_with("/multipart") {
        return match path {
            "/multipart/init" => "multipart_init",
            "/multipart/part-url" => "multipart_part_url",
            "/multipart/complete" => "multipart_complete",
            _ if path.starts_with("/multipart/abort/") => "multipart_abort",
            _ if path.starts_with("/multipart/status/") => "multipart_status",
            _ => "multipart_other",
        };
    }

    if path.starts_with("/files") {
        if path.ends_with("/verify") {
            return "files_verify";
        }
        return match method {
            "GET" => "files_list",
            _ => "files_other",
        };
    }

    "unknown"
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let operation = classify_operation(&method, &path);

    if let Some(cl) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_request_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    if let Some(cl) = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_response_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    response
}

/// Handler for GET /metrics — returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    metrics
        .process_peak_rss_bytes
        .set(crate::memory::get_peak_rss_bytes() as f64);
    metrics.index_entries.set(state.index.size() as f64);
    metrics
        .upload_sessions_active
        .set(state.uploads.active_count() as f64);

    let sample = state.memory.current();
    for level in ["normal", "warning", "critical"] {
        let active = if sample.pressure.to_string() == level { 1.0 } else { 0.0 };
        metrics
            .memory_pressure_level
            .with_label_values(&[level])
            .set(active);
    }

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}
