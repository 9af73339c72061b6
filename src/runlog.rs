//! Durable JSON run log
//!
//! One aggregator task owns the buffer and the log file. Transfers hold
//! cloneable [`LogSink`] handles and send entries over a channel, so every
//! entry reaches the file through a single writer exactly once.
//!
//! The file is a JSON array. A flush reads the current array, appends the
//! buffered entries and atomically replaces the file under an advisory lock.
//! Flushes happen when the buffer reaches the batch size, immediately after a
//! failure entry, on a timer, on [`LogSink::flush`] and on [`RunLogger::close`].

use chrono::{SecondsFormat, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::downloader::config::{LOG_BATCH_SIZE, LOG_FLUSH_INTERVAL, MAX_LOG_MESSAGE_CHARS};
use crate::downloader::TransferReport;

/// Run log errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunLogError {
    /// Filesystem error
    #[error("IO error: {0}")]
    Io(String),

    /// Entry (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Advisory lock could not be taken
    #[error("lock error: {0}")]
    Lock(String),

    /// Aggregator task is gone
    #[error("run logger closed")]
    Closed,
}

/// One per-item record in the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp
    pub timestamp: String,
    /// Work item identifier
    pub identifier: String,
    /// Work item title
    pub title: String,
    /// `success`, `skipped` or `failed`
    pub outcome: String,
    /// HTTP status code of a failure
    pub status_code: Option<u16>,
    /// Error or skip text, truncated
    pub message: Option<String>,
    /// Data rows in the output file
    pub rows_written: u64,
    /// Prefetched row count
    pub expected_rows: Option<u64>,
    /// Transfer attempts
    pub attempts: u32,
    /// Output file
    pub output_path: Option<String>,
    /// Seconds spent on the item
    pub duration_secs: f64,
}

impl LogEntry {
    /// Build an entry from a finished item
    pub fn from_report(report: &TransferReport) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            identifier: report.item.identifier.clone(),
            title: report.item.title.clone(),
            outcome: report.outcome.label().to_string(),
            status_code: report.outcome.status(),
            message: report.outcome.message().map(|m| truncate_message(&m)),
            rows_written: report.rows_written,
            expected_rows: report.item.expected_rows,
            attempts: report.attempts,
            output_path: report
                .output_path
                .as_ref()
                .map(|p| p.display().to_string()),
            duration_secs: (report.duration.as_secs_f64() * 1000.0).round() / 1000.0,
        }
    }

    /// Whether this entry records a failure
    pub fn is_failure(&self) -> bool {
        self.outcome == "failed"
    }
}

/// Cut a message to the maximum logged length (in characters)
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_LOG_MESSAGE_CHARS).collect()
}

/// When the buffer is written out
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush once this many entries are buffered
    pub batch_size: usize,
    /// Flush at least this often while entries are buffered
    pub flush_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            batch_size: LOG_BATCH_SIZE,
            flush_interval: LOG_FLUSH_INTERVAL,
        }
    }
}

enum LogCommand {
    Entry(Box<LogEntry>),
    Flush(oneshot::Sender<Result<(), RunLogError>>),
    Close(oneshot::Sender<Result<(), RunLogError>>),
}

/// Cloneable handle for sending entries to the aggregator
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl LogSink {
    /// Send an entry; returns false if the logger is already closed
    pub fn record(&self, entry: LogEntry) -> bool {
        let sent = self.tx.send(LogCommand::Entry(Box::new(entry))).is_ok();
        if !sent {
            error!("Run log entry dropped: logger closed");
        }
        sent
    }

    /// Send the entry for a finished item
    pub fn record_report(&self, report: &TransferReport) -> bool {
        self.record(LogEntry::from_report(report))
    }

    /// Write buffered entries now and wait for the result
    pub async fn flush(&self) -> Result<(), RunLogError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LogCommand::Flush(ack))
            .map_err(|_| RunLogError::Closed)?;
        done.await.map_err(|_| RunLogError::Closed)?
    }
}

/// Owner of the aggregator task
pub struct RunLogger {
    path: PathBuf,
    sink: LogSink,
    handle: JoinHandle<usize>,
}

impl RunLogger {
    /// Start the aggregator for `path`
    pub fn spawn(path: impl Into<PathBuf>, policy: FlushPolicy) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(aggregate(path.clone(), policy, rx));

        info!(path = %path.display(), "Run log started");
        Self {
            path,
            sink: LogSink { tx },
            handle,
        }
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// New handle for a producer
    pub fn sink(&self) -> LogSink {
        self.sink.clone()
    }

    /// Flush everything sent so far and stop the aggregator
    ///
    /// Returns the number of entries written during the run.
    pub async fn close(self) -> Result<usize, RunLogError> {
        let (ack, done) = oneshot::channel();
        self.sink
            .tx
            .send(LogCommand::Close(ack))
            .map_err(|_| RunLogError::Closed)?;
        let flushed = done.await.map_err(|_| RunLogError::Closed)?;

        let written = self
            .handle
            .await
            .map_err(|e| RunLogError::Io(format!("Run log task failed: {e}")))?;
        flushed?;

        info!(path = %self.path.display(), entries = written, "Run log closed");
        Ok(written)
    }
}

async fn aggregate(
    path: PathBuf,
    policy: FlushPolicy,
    mut rx: mpsc::UnboundedReceiver<LogCommand>,
) -> usize {
    let mut buffer: Vec<LogEntry> = Vec::new();
    let mut written = 0usize;

    let mut ticker = tokio::time::interval(policy.flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(LogCommand::Entry(entry)) => {
                    let urgent = entry.is_failure();
                    buffer.push(*entry);
                    if urgent || buffer.len() >= policy.batch_size.max(1) {
                        let _ = flush_buffer(&path, &mut buffer, &mut written);
                    }
                }
                Some(LogCommand::Flush(ack)) => {
                    let _ = ack.send(flush_buffer(&path, &mut buffer, &mut written));
                }
                Some(LogCommand::Close(ack)) => {
                    // Take whatever was queued ahead of the close
                    let mut waiting = vec![ack];
                    while let Ok(command) = rx.try_recv() {
                        match command {
                            LogCommand::Entry(entry) => buffer.push(*entry),
                            LogCommand::Flush(pending) | LogCommand::Close(pending) => {
                                waiting.push(pending);
                            }
                        }
                    }
                    let result = flush_buffer(&path, &mut buffer, &mut written);
                    for pending in waiting {
                        let _ = pending.send(result.clone());
                    }
                    break;
                }
                None => {
                    let _ = flush_buffer(&path, &mut buffer, &mut written);
                    break;
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    debug!(pending = buffer.len(), "Periodic run log flush");
                    let _ = flush_buffer(&path, &mut buffer, &mut written);
                }
            }
        }
    }

    if !buffer.is_empty() {
        error!(lost = buffer.len(), "Run log entries could not be written");
    }
    written
}

fn flush_buffer(
    path: &Path,
    buffer: &mut Vec<LogEntry>,
    written: &mut usize,
) -> Result<(), RunLogError> {
    if buffer.is_empty() {
        return Ok(());
    }
    match append_entries(path, buffer) {
        Ok(()) => {
            *written += buffer.len();
            buffer.clear();
            Ok(())
        }
        Err(e) => {
            // Entries stay buffered for the next flush
            error!(error = %e, pending = buffer.len(), "Run log flush failed");
            Err(e)
        }
    }
}

/// Append entries to the JSON array at `path`, atomically
pub fn append_entries(path: &Path, entries: &[LogEntry]) -> Result<(), RunLogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| RunLogError::Io(e.to_string()))?;
        }
    }

    let lock_path = path.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| RunLogError::Lock(format!("Failed to create lock file: {e}")))?;
    let mut lock = RwLock::new(lock_file);
    let _guard = lock
        .write()
        .map_err(|e| RunLogError::Lock(format!("Failed to acquire write lock: {e}")))?;

    let mut existing = read_existing(path)?;
    for entry in entries {
        existing.push(
            serde_json::to_value(entry).map_err(|e| RunLogError::Serialization(e.to_string()))?,
        );
    }

    let json = serde_json::to_string_pretty(&existing)
        .map_err(|e| RunLogError::Serialization(e.to_string()))?;

    let parent_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
        .map_err(|e| RunLogError::Io(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(json.as_bytes())
        .map_err(|e| RunLogError::Io(format!("Failed to write temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| RunLogError::Io(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| RunLogError::Io(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| RunLogError::Io(format!("Failed to persist temp file: {e}")))?;

    if let Ok(dir) = std::fs::File::open(parent_dir) {
        let _ = dir.sync_all();
    }

    debug!(
        path = %path.display(),
        appended = entries.len(),
        total = existing.len(),
        "Run log flushed"
    );
    Ok(())
}

fn read_existing(path: &Path) -> Result<Vec<Value>, RunLogError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RunLogError::Io(e.to_string())),
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Vec<Value>>(&content) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            let mut corrupt = path.as_os_str().to_owned();
            corrupt.push(".corrupt");
            warn!(
                path = %path.display(),
                error = %e,
                "Existing run log is not a JSON array, moving it aside"
            );
            std::fs::rename(path, &corrupt).map_err(|e| RunLogError::Io(e.to_string()))?;
            Ok(Vec::new())
        }
    }
}

/// Read a run log file
pub fn read_log(path: &Path) -> Result<Vec<LogEntry>, RunLogError> {
    let content = std::fs::read_to_string(path).map_err(|e| RunLogError::Io(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| RunLogError::Serialization(e.to_string()))
}
