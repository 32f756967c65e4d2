//! Prometheus metrics for crawl and resolution workers
//!
//! This module tracks:
//! - Queues: publishes by outcome, ready depth
//! - Pagination: pages fetched, crawls finished by stop reason, crawl failures
//! - Identities: activation attempts by result
//! - Quota: exhaustion events per job class
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for queue metrics
struct QueueMetrics {
    publishes: CounterVec,
    depth: GaugeVec,
}

/// Container for crawl worker metrics
struct CrawlMetrics {
    pages_fetched: CounterVec,
    crawls_finished: CounterVec,
    crawls_failed: CounterVec,
    crawl_duration: HistogramVec,
    identity_activations: CounterVec,
    quota_exhausted: CounterVec,
}

/// Global storage for queue metrics
static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();

/// Global storage for crawl metrics
static CRAWL_METRICS: OnceLock<CrawlMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let queue = QueueMetrics {
        publishes: register_counter_vec!(
            "resenha_queue_publishes_total",
            "Publishes by queue and outcome (accepted, rejected)",
            &["queue", "outcome"]
        )?,
        depth: register_gauge_vec!(
            "resenha_queue_ready_messages",
            "Ready messages observed in a queue",
            &["queue"]
        )?,
    };

    let crawl = CrawlMetrics {
        pages_fetched: register_counter_vec!(
            "resenha_pages_fetched_total",
            "Review pages fetched per locale",
            &["locale"]
        )?,
        crawls_finished: register_counter_vec!(
            "resenha_crawls_finished_total",
            "Crawls that reached a stop condition, by reason",
            &["reason"]
        )?,
        crawls_failed: register_counter_vec!(
            "resenha_crawls_failed_total",
            "Crawl attempts aborted, by error category",
            &["category"]
        )?,
        crawl_duration: register_histogram_vec!(
            "resenha_crawl_duration_seconds",
            "Wall time of one crawl attempt in seconds",
            &["worker"],
            vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0]
        )?,
        identity_activations: register_counter_vec!(
            "resenha_identity_activations_total",
            "Identity activation attempts by result",
            &["worker", "result"]
        )?,
        quota_exhausted: register_counter_vec!(
            "resenha_quota_exhausted_total",
            "Quota exhaustion events per job class",
            &["class"]
        )?,
    };

    QUEUE_METRICS
        .set(queue)
        .map_err(|_| "Queue metrics already initialized")?;
    CRAWL_METRICS
        .set(crawl)
        .map_err(|_| "Crawl metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    QUEUE_METRICS.get().is_some() && CRAWL_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a publish attempt
pub fn record_publish(queue: &str, outcome: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.publishes.with_label_values(&[queue, outcome]).inc();
    }
}

/// Update the observed ready depth of a queue
pub fn set_queue_depth(queue: &str, depth: usize) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.depth.with_label_values(&[queue]).set(depth as f64);
    }
}

/// Record one fetched page
pub fn record_page_fetched(locale: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.pages_fetched.with_label_values(&[locale]).inc();
    }
}

/// Record a crawl that reached a stop condition
pub fn record_crawl_finished(reason: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.crawls_finished.with_label_values(&[reason]).inc();
    }
}

/// Record an aborted crawl attempt
pub fn record_crawl_failed(category: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.crawls_failed.with_label_values(&[category]).inc();
    }
}

/// Record an identity activation attempt
pub fn record_identity_activation(worker: &str, result: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.identity_activations
            .with_label_values(&[worker, result])
            .inc();
    }
}

/// Record a quota exhaustion event
pub fn record_quota_exhausted(class: &str) {
    if let Some(m) = CRAWL_METRICS.get() {
        m.quota_exhausted.with_label_values(&[class]).inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a crawl timer for a worker
pub fn start_crawl_timer(worker: &str) -> MetricsTimer {
    match CRAWL_METRICS.get() {
        Some(m) => MetricsTimer::new(m.crawl_duration.with_label_values(&[worker]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_publish("crawl", "accepted");
        let text = encode_metrics().unwrap();
        assert!(text.contains("resenha_queue_publishes_total"));
    }

    #[test]
    fn test_recorders_do_not_panic() {
        ensure_metrics_initialized();
        record_publish("resolve", "rejected");
        set_queue_depth("crawl", 4);
        record_page_fetched("es");
        record_crawl_finished("last_page");
        record_crawl_failed("network");
        record_identity_activation("w1", "bound");
        record_quota_exhausted("resolve");
        let _timer = start_crawl_timer("w1");
    }
}
