use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, Histogram, HistogramVec, HistogramOpts, opts};
use once_cell::sync::Lazy;
use axum::{response::{IntoResponse, Response}, http::{StatusCode, Request, HeaderValue}, middleware::Next, body::Body};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use crate::config::LogFormat;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("http_requests_total", "HTTP request count"), &["method", "path", "status", "outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(HistogramOpts::new("http_request_duration_seconds", "HTTP request latency"), &["method", "path"]).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});
pub static UPLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("loom_uploads_total", "Uploads by final outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPLOAD_STAGE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("loom_upload_stage_failures_total", "Failed uploads by stage and error kind"), &["stage", "kind"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPLOAD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("loom_upload_bytes_total", "Bytes of bundles stored").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPLOAD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
    let h = Histogram::with_opts(HistogramOpts::new("loom_upload_duration_seconds", "Wall time of one upload, all stages").buckets(buckets)).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});
pub static HISTORY_WRITE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("loom_history_write_failures_total", "Deploy history rows that could not be written").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn record_upload_success(bytes: u64, seconds: f64) {
    UPLOADS_TOTAL.with_label_values(&["success"]).inc();
    UPLOAD_BYTES.inc_by(bytes);
    UPLOAD_DURATION.observe(seconds);
}

pub fn record_upload_failure(stage: &str, kind: &str, seconds: f64) {
    UPLOADS_TOTAL.with_label_values(&["failed"]).inc();
    UPLOAD_STAGE_FAILURES.with_label_values(&[stage, kind]).inc();
    UPLOAD_DURATION.observe(seconds);
}

pub fn record_history_failure() { HISTORY_WRITE_FAILURES.inc(); }

/// Collapse path segments that carry ids so label cardinality stays bounded.
pub fn normalize_path(path: &str) -> String {
    let segs: Vec<&str> = path.split('/').collect();
    let mut out = Vec::with_capacity(segs.len());
    for (i, s) in segs.iter().enumerate() {
        let prev = if i > 0 { segs[i - 1] } else { "" };
        if prev == "apps" && !s.is_empty() { out.push(":slug"); }
        else if Uuid::parse_str(s).is_ok() || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())) { out.push(":id"); }
        else { out.push(s); }
    }
    out.join("/")
}

pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = normalize_path(req.uri().path());
    let start = std::time::Instant::now();
    let mut resp = next.run(req).await;
    let status = resp.status();
    let outcome = if status.as_u16() < 400 { "success" } else { "error" };
    HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), status.as_str(), outcome]).inc();
    HTTP_REQUEST_DURATION.with_label_values(&[method.as_str(), path_label.as_str()]).observe(start.elapsed().as_secs_f64());
    if let Ok(v) = HeaderValue::from_str(&Uuid::new_v4().to_string()) { resp.headers_mut().insert("x-request-id", v); }
    resp
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}

/// Install the global subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    // a second init (tests, embedding) keeps the first subscriber
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}
