//! Observability metrics for the dataset downloader
//!
//! Counters and histograms for HTTP traffic, retries, pages and rows, plus
//! per-item outcome counters.
//!
//! ## Architecture
//!
//! - Uses the `metrics` crate for low-overhead metric collection
//! - Prometheus exporter is optional (`--metrics-addr`); without it every
//!   macro call is a no-op

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

static METRICS_INITIALIZED: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

/// Correlation ID generator for request tracing
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize metrics system with a Prometheus scrape endpoint
///
/// Idempotent: a second call is a no-op.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.lock().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "http_requests_total",
        Unit::Count,
        "Total number of HTTP requests made to the dataset API"
    );
    describe_counter!(
        "http_retries_total",
        Unit::Count,
        "Total number of request-level retry attempts"
    );
    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request duration in seconds"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Duration of retry backoff in seconds"
    );
    describe_counter!(
        "pages_fetched_total",
        Unit::Count,
        "Total number of pages fetched"
    );
    describe_counter!(
        "rows_written_total",
        Unit::Count,
        "Total number of CSV data rows written"
    );
    describe_counter!(
        "items_completed_total",
        Unit::Count,
        "Total number of datasets downloaded successfully"
    );
    describe_counter!(
        "items_failed_total",
        Unit::Count,
        "Total number of datasets that failed"
    );
    describe_counter!(
        "items_skipped_total",
        Unit::Count,
        "Total number of datasets skipped"
    );

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Timing and labelling for a single HTTP request
pub struct HttpRequestMetrics {
    endpoint: &'static str,
    start_time: Instant,
    correlation_id: String,
    attempt: u32,
}

impl HttpRequestMetrics {
    /// Start recording a new HTTP request against an endpoint kind
    /// (`data` or `stats`)
    pub fn start(endpoint: &'static str, attempt: u32) -> Self {
        let correlation_id = generate_correlation_id();

        debug!(
            correlation_id = %correlation_id,
            endpoint = endpoint,
            attempt = attempt,
            "Starting HTTP request"
        );

        Self {
            endpoint,
            start_time: Instant::now(),
            correlation_id,
            attempt,
        }
    }

    /// Record completion of the HTTP request
    pub fn record_complete(&self, status_code: u16) {
        let duration = self.start_time.elapsed();

        counter!(
            "http_requests_total",
            "endpoint" => self.endpoint,
            "status" => status_code.to_string(),
        )
        .increment(1);

        histogram!(
            "http_request_duration_seconds",
            "endpoint" => self.endpoint,
        )
        .record(duration.as_secs_f64());

        if status_code == 429 {
            warn!(
                correlation_id = %self.correlation_id,
                endpoint = self.endpoint,
                attempt = self.attempt,
                "Rate limit error (429) recorded"
            );
        }

        debug!(
            correlation_id = %self.correlation_id,
            endpoint = self.endpoint,
            status = status_code,
            duration_ms = duration.as_millis() as u64,
            "HTTP request completed"
        );
    }

    /// Record a network error (no status code)
    pub fn record_network_error(&self) {
        let duration = self.start_time.elapsed();

        counter!(
            "http_requests_total",
            "endpoint" => self.endpoint,
            "status" => "network_error",
        )
        .increment(1);

        histogram!(
            "http_request_duration_seconds",
            "endpoint" => self.endpoint,
        )
        .record(duration.as_secs_f64());

        warn!(
            correlation_id = %self.correlation_id,
            endpoint = self.endpoint,
            attempt = self.attempt,
            duration_ms = duration.as_millis() as u64,
            "Network error recorded"
        );
    }

    /// Get the correlation ID for this request
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record retry backoff duration
pub fn record_retry_backoff(duration: Duration, attempt: u32) {
    counter!("http_retries_total").increment(1);

    histogram!("retry_backoff_duration_seconds").record(duration.as_secs_f64());

    debug!(
        attempt = attempt,
        backoff_ms = duration.as_millis() as u64,
        "Retry backoff recorded"
    );
}

/// Record a written page
pub fn record_page(rows: usize) {
    counter!("pages_fetched_total").increment(1);
    counter!("rows_written_total").increment(rows as u64);
}

/// Per-item outcome metrics
pub struct ItemMetrics {
    identifier: String,
    start_time: Instant,
}

impl ItemMetrics {
    /// Start tracking a dataset transfer
    pub fn start(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            start_time: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn record_success(&self, rows: u64) {
        counter!("items_completed_total").increment(1);

        info!(
            identifier = %self.identifier,
            rows = rows,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Dataset downloaded successfully"
        );
    }

    /// Record a skipped item
    pub fn record_skip(&self, reason: &str) {
        counter!("items_skipped_total", "reason" => reason.to_string()).increment(1);

        info!(
            identifier = %self.identifier,
            reason = reason,
            "Dataset skipped"
        );
    }

    /// Record a failed item
    pub fn record_failure(&self, error: &str) {
        counter!("items_failed_total").increment(1);

        error!(
            identifier = %self.identifier,
            error = %error,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Dataset download failed"
        );
    }
}

/// Check if the metrics system is initialized
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.lock().await
}
