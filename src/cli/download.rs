//! Download command implementation

use super::{CliError, OutputFormat};
use crate::downloader::config::{
    DownloaderConfig, RetryPolicy, DEFAULT_BASE_URL, DEFAULT_ITEM_ATTEMPTS,
    DEFAULT_LARGE_THRESHOLD, DEFAULT_PAGE_SIZE, DEFAULT_WORKERS, MAX_RETRIES,
};
use crate::downloader::{DownloadScheduler, RunSummary};
use crate::fetcher::cms_http::CmsApiClient;
use crate::runlog::{FlushPolicy, RunLogger};
use crate::shutdown::SharedShutdown;
use crate::skip::SkipController;
use crate::storage::{BlobStore, LocalBlobStore};
use crate::worklist::{load_work_list, uuid_from_url};
use crate::WorkItem;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Upper bound for large-dataset workers
const MAX_WORKERS: usize = 32;

/// Parse and validate the worker count
fn parse_workers(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if value == 0 {
        return Err("workers must be at least 1".to_string());
    }
    if value > MAX_WORKERS {
        return Err(format!("workers {value} exceeds maximum of {MAX_WORKERS}"));
    }
    Ok(value)
}

/// Download command arguments
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// Work list CSV (Title, Description, API URL, UUID, Dataset URL)
    #[arg(long, conflicts_with = "id", required_unless_present = "id")]
    pub input: Option<PathBuf>,

    /// Download a single dataset by UUID (or API URL)
    #[arg(long)]
    pub id: Option<String>,

    /// Display title for `--id`
    #[arg(long, requires = "id")]
    pub title: Option<String>,

    /// Directory for CSV outputs
    #[arg(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Directory for run logs
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Name used in the run-log file name (defaults to the work list name)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Records per page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u64).range(1..))]
    pub page_size: u64,

    /// Rows above which a dataset runs on the background worker pool
    #[arg(long, default_value_t = DEFAULT_LARGE_THRESHOLD)]
    pub large_threshold: u64,

    /// Concurrent workers for large datasets (max 32)
    #[arg(long, default_value_t = DEFAULT_WORKERS, value_parser = parse_workers)]
    pub workers: usize,

    /// Retries per HTTP request (429, 5xx and network errors)
    #[arg(long, default_value_t = MAX_RETRIES, value_parser = clap::value_parser!(u32).range(0..=20))]
    pub max_retries: u32,

    /// Attempts per dataset; later attempts resume after the last written page
    #[arg(long, default_value_t = DEFAULT_ITEM_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub item_attempts: u32,

    /// Re-download datasets whose output file already exists
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Do not read skip commands from stdin
    #[arg(long, default_value_t = false)]
    pub no_skip_listener: bool,

    /// Mirror finished files into this directory
    #[arg(long, conflicts_with = "s3_bucket")]
    pub blob_dir: Option<PathBuf>,

    /// Upload finished files to this S3 bucket (requires the `s3` feature)
    #[arg(long, env = "HCDL_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Key prefix for uploaded files
    #[arg(long, default_value = "")]
    pub s3_prefix: String,

    /// Remove local files once uploaded
    #[arg(long, default_value_t = false)]
    pub delete_after_upload: bool,

    /// Dataset API base URL
    #[arg(long, env = "HCDL_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl DownloadArgs {
    /// Runtime configuration assembled from the flags
    pub fn config(&self) -> DownloaderConfig {
        DownloaderConfig {
            base_url: self.base_url.clone(),
            output_dir: self.output_dir.clone(),
            log_dir: self.log_dir.clone(),
            page_size: self.page_size,
            large_threshold: self.large_threshold,
            workers: self.workers,
            retry: RetryPolicy {
                max_attempts: self.item_attempts,
                ..RetryPolicy::default()
            },
            force: self.force,
            delete_after_upload: self.delete_after_upload,
            ..DownloaderConfig::default()
        }
    }

    /// Items to download, from the work list or `--id`
    pub fn work_items(&self) -> Result<Vec<WorkItem>, CliError> {
        match (&self.input, &self.id) {
            (Some(path), _) => Ok(load_work_list(path)?),
            (None, Some(raw)) => {
                let raw = raw.trim();
                let identifier = uuid_from_url(raw).unwrap_or_else(|| raw.to_string());
                if identifier.is_empty() {
                    return Err(CliError::InvalidArgument("--id cannot be empty".to_string()));
                }
                let title = self.title.clone().unwrap_or_else(|| identifier.clone());
                Ok(vec![WorkItem::new(identifier, title)])
            }
            (None, None) => Err(CliError::InvalidArgument(
                "either --input or --id is required".to_string(),
            )),
        }
    }

    fn log_run_id(&self) -> String {
        if let Some(id) = &self.run_id {
            return id.clone();
        }
        match (&self.input, &self.id) {
            (Some(path), _) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".to_string()),
            (None, Some(_)) => "single".to_string(),
            (None, None) => "run".to_string(),
        }
    }

    async fn blob_store(&self) -> Result<Option<Arc<dyn BlobStore>>, CliError> {
        if let Some(bucket) = &self.s3_bucket {
            return s3_store(bucket).await.map(Some);
        }
        Ok(self
            .blob_dir
            .as_ref()
            .map(|dir| Arc::new(LocalBlobStore::new(dir)) as Arc<dyn BlobStore>))
    }

    /// Execute the download command
    pub async fn execute(&self, format: OutputFormat, shutdown: SharedShutdown) -> Result<(), CliError> {
        if let Some(addr) = self.metrics_addr {
            crate::metrics::init_metrics(addr)
                .await
                .map_err(|e| CliError::ConfigurationError(format!("metrics exporter: {e}")))?;
        }

        let items = self.work_items()?;
        let config = self.config();
        ensure_dir(&config.output_dir)?;
        ensure_dir(&config.log_dir)?;

        let client = Arc::new(
            CmsApiClient::with_defaults(config.base_url.clone()).with_max_retries(self.max_retries),
        );
        let logger = RunLogger::spawn(config.log_path(&self.log_run_id()), FlushPolicy::default());

        let mut scheduler =
            DownloadScheduler::new(config.clone(), client.clone(), client, logger.sink())
                .with_shutdown(shutdown);
        if !self.no_skip_listener {
            scheduler = scheduler.with_skip_controller(SkipController::with_stdin());
        }
        if let Some(store) = self.blob_store().await? {
            info!(store = %store.describe(), prefix = %self.s3_prefix, "Blob store enabled");
            scheduler = scheduler.with_blob_store(store, self.s3_prefix.clone());
        }

        let progress = (format == OutputFormat::Human).then(|| create_progress_bar(items.len()));
        if let Some(bar) = &progress {
            scheduler = scheduler.with_progress_bar(bar.clone());
        }

        info!(
            datasets = items.len(),
            output_dir = %config.output_dir.display(),
            base_url = %config.base_url,
            "Starting download run"
        );
        let summary = scheduler.run(items).await;

        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        let log_path = logger.path().to_path_buf();
        let entries = logger.close().await?;

        match format {
            OutputFormat::Json => output_json(&summary, &log_path),
            OutputFormat::Human => output_human(&summary, &log_path, entries),
        }

        if summary.failed > 0 {
            warn!(failed = summary.failed, "Some datasets failed, see the run log");
        }
        Ok(())
    }
}

#[cfg(feature = "s3")]
async fn s3_store(bucket: &str) -> Result<Arc<dyn BlobStore>, CliError> {
    Ok(Arc::new(crate::storage::S3BlobStore::from_env(bucket).await))
}

#[cfg(not(feature = "s3"))]
async fn s3_store(bucket: &str) -> Result<Arc<dyn BlobStore>, CliError> {
    Err(CliError::ConfigurationError(format!(
        "--s3-bucket {bucket} requires a build with the `s3` feature"
    )))
}

fn ensure_dir(dir: &Path) -> Result<(), CliError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        CliError::InvalidArgument(format!("Failed to create directory {}: {e}", dir.display()))
    })
}

/// Output the run summary as JSON
fn output_json(summary: &RunSummary, log_path: &Path) {
    let mut output = summary.to_json();
    output["log_path"] = serde_json::Value::String(log_path.display().to_string());
    println!("{output}");
}

/// Output the run summary in human-readable format
fn output_human(summary: &RunSummary, log_path: &Path, entries: usize) {
    println!(
        "\nDownload run finished in {}",
        crate::downloader::progress::format_duration(summary.duration)
    );
    println!("Datasets: {}", summary.total);
    println!("  Succeeded: {}", summary.succeeded);
    println!("  Skipped: {}", summary.skipped);
    println!("  Failed: {}", summary.failed);
    println!("Rows written: {}", summary.rows_written);
    println!("Run log: {} ({} entries)", log_path.display(), entries);

    if summary.failed > 0 {
        eprintln!("\nFailed datasets:");
        for report in summary.failures() {
            let status = report
                .outcome
                .status()
                .map(|s| format!(" [HTTP {s}]"))
                .unwrap_or_default();
            eprintln!(
                "  - {} ({}){}: {}",
                report.item.label(),
                report.item.identifier,
                status,
                report.outcome.message().unwrap_or_default()
            );
        }
    }
}

/// Create the per-run progress bar
fn create_progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} datasets {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}
