//! Download scheduler
//!
//! Row counts are prefetched for the whole work list, then items are split
//! at the large-dataset threshold. Small (or unknown-size) items run one
//! after another as foreground items; large items run afterwards on a
//! bounded worker pool. Every item ends with exactly one recorded outcome,
//! including items that never started because of a shutdown.

use crate::downloader::config::DownloaderConfig;
use crate::downloader::executor::TransferExecutor;
use crate::downloader::job::{ItemState, ItemTracker, TransferOutcome, TransferReport};
use crate::fetcher::stats::{prefetch_row_counts, RowCountSource};
use crate::fetcher::PageSource;
use crate::runlog::LogSink;
use crate::shutdown::{self, SharedShutdown};
use crate::skip::{SkipController, SkipToken};
use crate::storage::BlobStore;
use crate::WorkItem;
use futures::FutureExt;
use indicatif::ProgressBar;
use serde_json::json;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

/// Message for items that never started because of a shutdown
pub const NOT_STARTED_MESSAGE: &str = "shutdown requested before transfer started";

/// Aggregate result of one run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Items scheduled
    pub total: usize,
    /// Items downloaded
    pub succeeded: usize,
    /// Items that failed
    pub failed: usize,
    /// Items skipped
    pub skipped: usize,
    /// Data rows written across all items
    pub rows_written: u64,
    /// Per-item reports in completion order
    pub reports: Vec<TransferReport>,
    /// Wall time of the run
    pub duration: Duration,
}

impl RunSummary {
    fn add(&mut self, report: TransferReport) {
        match report.outcome {
            TransferOutcome::Success { .. } => self.succeeded += 1,
            TransferOutcome::Skipped { .. } => self.skipped += 1,
            TransferOutcome::Failed { .. } => self.failed += 1,
        }
        self.rows_written += report.rows_written;
        self.reports.push(report);
    }

    /// Reports of failed items
    pub fn failures(&self) -> impl Iterator<Item = &TransferReport> {
        self.reports.iter().filter(|r| r.outcome.is_failure())
    }

    /// Machine-readable form for `--output-format json`
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "total": self.total,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "skipped": self.skipped,
            "rows_written": self.rows_written,
            "duration_secs": self.duration.as_secs_f64(),
            "items": self.reports.iter().map(|r| json!({
                "identifier": r.item.identifier,
                "title": r.item.title,
                "outcome": r.outcome.label(),
                "status_code": r.outcome.status(),
                "message": r.outcome.message(),
                "rows_written": r.rows_written,
                "expected_rows": r.item.expected_rows,
                "output_path": r.output_path.as_ref().map(|p| p.display().to_string()),
            })).collect::<Vec<_>>(),
        })
    }
}

/// Split items into `(small, large)` at `threshold` rows, keeping order
///
/// Unknown counts are small.
pub fn partition(items: Vec<WorkItem>, threshold: u64) -> (Vec<WorkItem>, Vec<WorkItem>) {
    items
        .into_iter()
        .partition(|item| item.expected_rows.map(|n| n <= threshold).unwrap_or(true))
}

/// Runs a work list to completion
pub struct DownloadScheduler {
    executor: TransferExecutor,
    counts: Arc<dyn RowCountSource>,
    log: LogSink,
    skip: Option<SkipController>,
    progress_bar: Option<ProgressBar>,
    shutdown: Option<SharedShutdown>,
}

struct RunState {
    trackers: HashMap<String, ItemTracker>,
    items: HashMap<String, WorkItem>,
    summary: RunSummary,
}

impl DownloadScheduler {
    /// Create a scheduler
    pub fn new(
        config: DownloaderConfig,
        source: Arc<dyn PageSource>,
        counts: Arc<dyn RowCountSource>,
        log: LogSink,
    ) -> Self {
        Self {
            executor: TransferExecutor::new(config, source),
            counts,
            log,
            skip: None,
            progress_bar: None,
            shutdown: shutdown::get_global_shutdown(),
        }
    }

    /// Upload finished files to a blob store
    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        self.executor = self.executor.with_blob_store(store, prefix);
        self
    }

    /// Route operator skip commands to transfers
    pub fn with_skip_controller(mut self, controller: SkipController) -> Self {
        self.skip = Some(controller);
        self
    }

    /// Advance a progress bar as items finish
    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.progress_bar = Some(bar);
        self
    }

    /// Attach a shared shutdown handle for graceful cancellation.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.executor = self.executor.with_shutdown(shutdown.clone());
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    /// Run every item and return the summary
    ///
    /// All outcomes are handed to the run log and flushed before this returns.
    pub async fn run(&self, items: Vec<WorkItem>) -> RunSummary {
        let started = Instant::now();
        let config = self.executor.config().clone();

        let mut seen = HashSet::new();
        let items: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| {
                let fresh = seen.insert(item.identifier.clone());
                if !fresh {
                    warn!(identifier = %item.identifier, "Duplicate work item dropped");
                }
                fresh
            })
            .collect();

        let mut state = RunState {
            trackers: items
                .iter()
                .map(|i| (i.identifier.clone(), ItemTracker::new(&i.identifier)))
                .collect(),
            items: items
                .iter()
                .map(|i| (i.identifier.clone(), i.clone()))
                .collect(),
            summary: RunSummary {
                total: items.len(),
                ..Default::default()
            },
        };

        let items = if self.shutdown_requested() {
            items
        } else {
            for tracker in state.trackers.values_mut() {
                if let Err(e) = tracker.transition(ItemState::Prefetching) {
                    warn!(error = %e, "Unexpected state before prefetch");
                }
            }
            info!(items = items.len(), "Prefetching row counts");
            let items =
                prefetch_row_counts(self.counts.clone(), items, config.prefetch_concurrency).await;
            for item in &items {
                state.items.insert(item.identifier.clone(), item.clone());
            }
            items
        };

        let (small, large) = partition(items, config.large_threshold);
        info!(
            small = small.len(),
            large = large.len(),
            threshold = config.large_threshold,
            workers = config.workers,
            "Scheduling transfers"
        );

        for item in small {
            if self.shutdown_requested() {
                self.record(&mut state, not_started(item));
                continue;
            }
            self.start(&mut state, &item);
            let token = self.skip.as_ref().map(|c| c.register(&item.identifier, true));
            let report = execute_contained(&self.executor, item, token.as_ref()).await;
            drop(token);
            self.record(&mut state, report);
        }

        self.run_pool(&mut state, large, config.workers.max(1)).await;

        self.sweep_unfinished(&mut state);

        if let Err(e) = self.log.flush().await {
            error!(error = %e, "Failed to flush run log");
        }

        let mut summary = state.summary;
        summary.duration = started.elapsed();
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            rows = summary.rows_written,
            "Run finished"
        );
        summary
    }

    async fn run_pool(&self, state: &mut RunState, large: Vec<WorkItem>, workers: usize) {
        if large.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut pool: JoinSet<TransferReport> = JoinSet::new();

        for item in large {
            // Collect finished workers while waiting for a free slot
            let permit = loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => break permit,
                    Some(joined) = pool.join_next(), if !pool.is_empty() => {
                        self.record_joined(state, joined);
                    }
                }
            };

            let Ok(permit) = permit else {
                self.record(state, not_started(item));
                continue;
            };

            if self.shutdown_requested() {
                drop(permit);
                self.record(state, not_started(item));
                continue;
            }

            self.start(state, &item);
            let token = self.skip.as_ref().map(|c| c.register(&item.identifier, false));
            let executor = self.executor.clone();

            pool.spawn(async move {
                let _permit = permit;
                let report = execute_contained(&executor, item, token.as_ref()).await;
                drop(token);
                report
            });
        }

        while let Some(joined) = pool.join_next().await {
            self.record_joined(state, joined);
        }
    }

    /// Fail anything still open; it never reported back (aborted task)
    fn sweep_unfinished(&self, state: &mut RunState) {
        let unfinished: Vec<String> = state
            .trackers
            .iter()
            .filter(|(_, t)| !t.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for identifier in unfinished {
            error!(identifier = %identifier, "Transfer ended without an outcome");
            let item = state
                .items
                .get(&identifier)
                .cloned()
                .unwrap_or_else(|| WorkItem::new(identifier, ""));
            let report = TransferReport::not_started(
                item,
                TransferOutcome::Failed {
                    error: "transfer did not report an outcome".to_string(),
                    status: None,
                },
            );
            self.record(state, report);
        }
    }

    fn record_joined(&self, state: &mut RunState, joined: Result<TransferReport, JoinError>) {
        match joined {
            Ok(report) => self.record(state, report),
            // Covered by the unfinished sweep at the end of the run
            Err(e) => error!(error = %e, "Worker task failed"),
        }
    }

    fn start(&self, state: &mut RunState, item: &WorkItem) {
        if let Some(tracker) = state.trackers.get_mut(&item.identifier) {
            if let Err(e) = tracker.transition(ItemState::Transferring) {
                warn!(error = %e, "Unexpected state before transfer");
            }
        }
    }

    fn record(&self, state: &mut RunState, report: TransferReport) {
        let identifier = report.item.identifier.clone();
        if let Some(tracker) = state.trackers.get_mut(&identifier) {
            if let Err(e) = tracker.finish(&report.outcome) {
                error!(error = %e, "Duplicate outcome ignored");
                return;
            }
        }

        match &report.outcome {
            TransferOutcome::Success { rows } => {
                info!(identifier = %identifier, title = %report.item.title, rows = rows, "Dataset done")
            }
            TransferOutcome::Skipped { reason } => {
                info!(identifier = %identifier, title = %report.item.title, reason = reason.as_str(), "Dataset skipped")
            }
            TransferOutcome::Failed { error, status } => {
                warn!(identifier = %identifier, title = %report.item.title, status = ?status, error = %error, "Dataset failed")
            }
        }

        self.log.record_report(&report);
        if let Some(bar) = &self.progress_bar {
            bar.set_message(report.item.label().to_string());
            bar.inc(1);
        }
        state.summary.add(report);
    }
}

fn not_started(item: WorkItem) -> TransferReport {
    TransferReport::not_started(
        item,
        TransferOutcome::Failed {
            error: NOT_STARTED_MESSAGE.to_string(),
            status: None,
        },
    )
}

/// Run one transfer, turning a panic into a `Failed` outcome for that item
async fn execute_contained(
    executor: &TransferExecutor,
    item: WorkItem,
    token: Option<&SkipToken>,
) -> TransferReport {
    match AssertUnwindSafe(executor.execute(&item, token))
        .catch_unwind()
        .await
    {
        Ok(report) => report,
        Err(panic) => {
            let message = format!("worker panicked: {}", panic_message(panic.as_ref()));
            error!(identifier = %item.identifier, "{}", message);
            TransferReport::not_started(
                item,
                TransferOutcome::Failed {
                    error: message,
                    status: None,
                },
            )
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
