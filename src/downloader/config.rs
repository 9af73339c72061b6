//! Download configuration constants and the assembled runtime configuration

use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of request-level retries for a single HTTP call.
pub const MAX_RETRIES: u32 = 5;

/// Request-level retries for row-count lookups, which are advisory.
pub const STATS_MAX_RETRIES: u32 = 1;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Default records requested per page.
pub const DEFAULT_PAGE_SIZE: u64 = 5000;

/// Datasets with more expected rows than this run on the worker pool.
pub const DEFAULT_LARGE_THRESHOLD: u64 = 1_000_000;

/// Default number of concurrent large-dataset workers.
pub const DEFAULT_WORKERS: usize = 3;

/// Default attempts per dataset (first try included).
pub const DEFAULT_ITEM_ATTEMPTS: u32 = 3;

/// Default concurrency for row-count prefetch requests.
pub const DEFAULT_PREFETCH_CONCURRENCY: usize = 4;

/// Politeness budget: requests allowed per [`RATE_LIMIT_WINDOW`].
pub const DEFAULT_REQUESTS_PER_WINDOW: usize = 10;

/// Politeness window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Run-log entries buffered before a flush.
pub const LOG_BATCH_SIZE: usize = 5;

/// Maximum age of buffered run-log entries.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Run-log messages are truncated to this many characters.
pub const MAX_LOG_MESSAGE_CHARS: usize = 500;

/// Emit a progress line every N pages for large datasets.
pub const PROGRESS_PAGE_INTERVAL: u64 = 10;

/// Default CMS dataset API base.
pub const DEFAULT_BASE_URL: &str = "https://data.cms.gov/data-api/v1/dataset";

/// Calculate exponential backoff delay
pub fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let delay_ms = delay_ms.min(MAX_BACKOFF_MS);
    Duration::from_millis(delay_ms)
}

/// Item-level retry policy.
///
/// A retryable failure restarts the page stream after the last completed
/// page; `max_attempts` counts the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ITEM_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-indexed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Runtime configuration for a download run
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// API base, e.g. `https://data.cms.gov/data-api/v1/dataset`
    pub base_url: String,
    /// Directory for CSV outputs
    pub output_dir: PathBuf,
    /// Directory for run logs
    pub log_dir: PathBuf,
    /// Records per page
    pub page_size: u64,
    /// Rows above which a dataset is scheduled on the worker pool
    pub large_threshold: u64,
    /// Concurrent large-dataset workers
    pub workers: usize,
    /// Concurrency of row-count prefetch
    pub prefetch_concurrency: usize,
    /// Item-level retry policy
    pub retry: RetryPolicy,
    /// Re-download datasets whose output already exists
    pub force: bool,
    /// Remove the local file after a successful upload
    pub delete_after_upload: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            output_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            page_size: DEFAULT_PAGE_SIZE,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            workers: DEFAULT_WORKERS,
            prefetch_concurrency: DEFAULT_PREFETCH_CONCURRENCY,
            retry: RetryPolicy::default(),
            force: false,
            delete_after_upload: false,
        }
    }
}

impl DownloaderConfig {
    /// Run-log path for a run: `<log_dir>/download_log_<run_id>_<YYYYmmdd_HHMMSS>.json`
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        log_path_in(&self.log_dir, run_id)
    }
}

/// Build a run-log path inside `log_dir`
pub fn log_path_in(log_dir: &Path, run_id: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    log_dir.join(format!("download_log_{run_id}_{stamp}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(1), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(2), Duration::from_millis(4000));
        assert_eq!(calculate_backoff(3), Duration::from_millis(8000));
        assert_eq!(calculate_backoff(4), Duration::from_millis(16000));
        assert_eq!(calculate_backoff(10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(calculate_backoff(200), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_retry_policy_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));

        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn test_log_path_shape() {
        let config = DownloaderConfig {
            log_dir: PathBuf::from("/tmp/logs"),
            ..Default::default()
        };
        let path = config.log_path("run42");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(path.starts_with("/tmp/logs"));
        assert!(name.starts_with("download_log_run42_"));
        assert!(name.ends_with(".json"));
        // download_log_run42_ + YYYYmmdd_HHMMSS + .json
        assert_eq!(name.len(), "download_log_run42_".len() + 15 + 5);
    }
}
