//! Per-item transfer executor
//!
//! Streams one dataset into `<name>.csv.part`, one whole page at a time, and
//! renames it to `<name>.csv` once the last page is written. Retryable
//! failures restart the page stream right after the last written page, on
//! the same file, so no record is written twice.

use crate::downloader::config::DownloaderConfig;
use crate::downloader::job::{SkipReason, TransferOutcome, TransferReport};
use crate::downloader::progress::{ProgressState, ProgressTracker};
use crate::downloader::DownloadError;
use crate::fetcher::pagination::page_stream;
use crate::fetcher::PageSource;
use crate::metrics::{self, ItemMetrics};
use crate::output::csv::StreamingCsvWriter;
use crate::output::path::{OutputPaths, ResumeDecision};
use crate::output::{OutputWriter, RecordsWriter};
use crate::shutdown::{self, SharedShutdown};
use crate::skip::SkipToken;
use crate::storage::{blob_key, upload_file, BlobStore};
use crate::WorkItem;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Message recorded when a transfer returns no records at all
pub const NO_DATA_MESSAGE: &str = "no data";

/// Runs single-item transfers
#[derive(Clone)]
pub struct TransferExecutor {
    config: DownloaderConfig,
    source: Arc<dyn PageSource>,
    blob_store: Option<Arc<dyn BlobStore>>,
    blob_prefix: String,
    progress_tracker: ProgressTracker,
    shutdown: Option<SharedShutdown>,
}

impl TransferExecutor {
    /// Create an executor reading pages from `source`
    pub fn new(config: DownloaderConfig, source: Arc<dyn PageSource>) -> Self {
        Self {
            config,
            source,
            blob_store: None,
            blob_prefix: String::new(),
            progress_tracker: ProgressTracker::default(),
            shutdown: shutdown::get_global_shutdown(),
        }
    }

    /// Upload finished files to a blob store under `prefix`
    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        self.blob_store = Some(store);
        self.blob_prefix = prefix.into();
        self
    }

    /// Attach a shared shutdown handle for graceful cancellation.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Override progress tracking configuration.
    pub fn with_progress_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.progress_tracker = tracker;
        self
    }

    /// Runtime configuration
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    /// Transfer one item and report its outcome. Never fails: errors become
    /// [`TransferOutcome::Failed`].
    pub async fn execute(&self, item: &WorkItem, skip: Option<&SkipToken>) -> TransferReport {
        let span = info_span!("transfer", identifier = %item.identifier);
        self.execute_inner(item, skip).instrument(span).await
    }

    async fn execute_inner(&self, item: &WorkItem, skip: Option<&SkipToken>) -> TransferReport {
        let started = Instant::now();
        let item_metrics = ItemMetrics::start(&item.identifier);
        let paths = OutputPaths::for_item(&self.config.output_dir, item);
        let key = blob_key(&self.blob_prefix, &paths.file_name());

        info!(
            title = %item.title,
            expected_rows = ?item.expected_rows,
            "Starting transfer"
        );

        let mut report = TransferReport::not_started(
            item.clone(),
            TransferOutcome::Failed {
                error: String::new(),
                status: None,
            },
        );

        let outcome = match self.run(item, &paths, &key, skip, &mut report).await {
            Ok(outcome) => outcome,
            Err(e) => TransferOutcome::failed(&e),
        };
        report.outcome = outcome;
        report.duration = started.elapsed();

        match &report.outcome {
            TransferOutcome::Success { rows } => item_metrics.record_success(*rows),
            TransferOutcome::Skipped { reason } => item_metrics.record_skip(reason.as_str()),
            TransferOutcome::Failed { error, .. } => item_metrics.record_failure(error),
        }
        report
    }

    async fn run(
        &self,
        item: &WorkItem,
        paths: &OutputPaths,
        key: &str,
        skip: Option<&SkipToken>,
        report: &mut TransferReport,
    ) -> Result<TransferOutcome, DownloadError> {
        if let Some(store) = &self.blob_store {
            if !self.config.force {
                match store.exists(key).await {
                    Ok(true) => {
                        info!(key = key, "Object already in blob store");
                        return Ok(TransferOutcome::Skipped {
                            reason: SkipReason::AlreadyUploaded,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => warn!(key = key, error = %e, "Blob existence check failed"),
                }
            }
        }

        let decision = paths.decide(self.config.force)?;
        if decision == ResumeDecision::AlreadyComplete {
            info!(path = %paths.final_path.display(), "Output already exists, skipping");
            report.output_path = Some(paths.final_path.clone());
            // A finished file that never made it to the store is uploaded now
            self.upload(paths.final_path.clone(), key).await?;
            return Ok(TransferOutcome::Skipped {
                reason: SkipReason::AlreadyDownloaded,
            });
        }

        let mut writer = match decision {
            ResumeDecision::Partial => StreamingCsvWriter::resume(&paths.part_path)?,
            _ => StreamingCsvWriter::new(&paths.part_path),
        };
        let mut progress = self
            .progress_tracker
            .create_state(item.expected_rows)
            .with_resumed_rows(writer.rows_written());

        let result = self
            .transfer_with_retry(item, &mut writer, skip, &mut progress, report)
            .await;

        report.rows_written = writer.rows_written();
        let had_file = writer.is_open();
        let closed = writer.close();
        if had_file {
            report.output_path = Some(paths.part_path.clone());
        }

        match result {
            Ok(()) => {
                closed?;
                if report.rows_written == 0 {
                    return Err(DownloadError::Transport {
                        status: None,
                        message: NO_DATA_MESSAGE.to_string(),
                    });
                }

                paths.finalize()?;
                report.output_path = Some(paths.final_path.clone());

                if let Some(expected) = item.expected_rows {
                    if expected != report.rows_written {
                        warn!(
                            expected_rows = expected,
                            rows = report.rows_written,
                            "Row count differs from prefetched count"
                        );
                    }
                }

                self.upload(paths.final_path.clone(), key).await?;
                Ok(TransferOutcome::Success {
                    rows: report.rows_written,
                })
            }
            Err(DownloadError::Skipped) => {
                if let Err(e) = closed {
                    warn!(error = %e, "Failed to close partial file after skip");
                }
                info!(rows = report.rows_written, "Transfer skipped by operator");
                Ok(TransferOutcome::Skipped {
                    reason: SkipReason::OperatorRequest,
                })
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!(error = %close_err, "Failed to close partial file");
                }
                if had_file {
                    info!(
                        path = %paths.part_path.display(),
                        rows = report.rows_written,
                        "Partial file kept for resume"
                    );
                }
                Err(e)
            }
        }
    }

    async fn transfer_with_retry(
        &self,
        item: &WorkItem,
        writer: &mut StreamingCsvWriter,
        skip: Option<&SkipToken>,
        progress: &mut ProgressState,
        report: &mut TransferReport,
    ) -> Result<(), DownloadError> {
        let policy = self.config.retry;

        loop {
            report.attempts += 1;
            let attempt = report.attempts;

            let err = match self.stream_pages(item, writer, skip, progress).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !err.is_retryable() || !policy.should_retry(attempt) || self.shutdown_requested() {
                return Err(err);
            }

            let backoff = policy.backoff(attempt);
            warn!(
                attempt = attempt,
                max_attempts = policy.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                resume_offset = writer.rows_written(),
                error = %err,
                "Transfer failed, retrying after backoff"
            );
            if !self.sleep_unless_shutdown(backoff).await {
                return Err(DownloadError::Shutdown);
            }
        }
    }

    async fn stream_pages(
        &self,
        item: &WorkItem,
        writer: &mut StreamingCsvWriter,
        skip: Option<&SkipToken>,
        progress: &mut ProgressState,
    ) -> Result<(), DownloadError> {
        let start_offset = writer.rows_written();
        if start_offset > 0 {
            info!(offset = start_offset, "Continuing after rows already on disk");
        }

        let mut pages = page_stream(
            self.source.clone(),
            item.identifier.clone(),
            self.config.page_size,
            start_offset,
        );

        loop {
            if self.shutdown_requested() {
                return Err(DownloadError::Shutdown);
            }
            if skip.map(|token| token.is_requested()).unwrap_or(false) {
                return Err(DownloadError::Skipped);
            }

            let Some(page) = pages.next().await else {
                return Ok(());
            };
            let page = page?;

            let rows = writer.write_page(&page.records)?;
            metrics::record_page(rows);
            progress.record_page(rows as u64);

            debug!(offset = page.offset, rows = rows, "Page written");

            if progress.should_emit_update() {
                info!(title = %item.title, "{}", progress.format_progress());
                progress.mark_emitted();
            }
        }
    }

    async fn upload(&self, path: PathBuf, key: &str) -> Result<(), DownloadError> {
        let Some(store) = &self.blob_store else {
            return Ok(());
        };

        upload_file(store.as_ref(), &path, key)
            .await
            .map_err(|e| DownloadError::Storage(e.to_string()))?;

        if self.config.delete_after_upload {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove uploaded file");
            }
        }
        Ok(())
    }

    async fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        if self.shutdown_requested() {
            return false;
        }
        match &self.shutdown {
            Some(shutdown) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => true,
                    _ = shutdown.wait_for_shutdown() => false,
                }
            }
            None => {
                tokio::time::sleep(duration).await;
                true
            }
        }
    }
}
