//! Item outcomes and state tracking

use crate::downloader::DownloadError;
use crate::WorkItem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Why an item was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Operator typed a skip command
    OperatorRequest,
    /// Finished output already on disk
    AlreadyDownloaded,
    /// Object already present in the blob store
    AlreadyUploaded,
}

impl SkipReason {
    /// Stable snake_case label
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OperatorRequest => "operator_request",
            SkipReason::AlreadyDownloaded => "already_downloaded",
            SkipReason::AlreadyUploaded => "already_uploaded",
        }
    }

    /// Message recorded in the run log
    pub fn message(&self) -> &'static str {
        match self {
            SkipReason::OperatorRequest => "Skipped by user",
            SkipReason::AlreadyDownloaded => "Output file already exists",
            SkipReason::AlreadyUploaded => "Object already exists in blob store",
        }
    }
}

/// Terminal result of one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// All pages written
    Success {
        /// Data rows in the output file
        rows: u64,
    },
    /// Item was not (fully) transferred on purpose
    Skipped {
        /// Why
        reason: SkipReason,
    },
    /// Item could not be transferred
    Failed {
        /// Error description
        error: String,
        /// HTTP status, when the failure came from the server
        status: Option<u16>,
    },
}

impl TransferOutcome {
    /// Build a failure from a download error
    pub fn failed(err: &DownloadError) -> Self {
        TransferOutcome::Failed {
            error: err.to_string(),
            status: err.status(),
        }
    }

    /// `success`, `skipped` or `failed`
    pub fn label(&self) -> &'static str {
        match self {
            TransferOutcome::Success { .. } => "success",
            TransferOutcome::Skipped { .. } => "skipped",
            TransferOutcome::Failed { .. } => "failed",
        }
    }

    /// Whether this is a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, TransferOutcome::Failed { .. })
    }

    /// HTTP status of a failure
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferOutcome::Failed { status, .. } => *status,
            _ => None,
        }
    }

    /// Human-readable message for logs
    pub fn message(&self) -> Option<String> {
        match self {
            TransferOutcome::Success { .. } => None,
            TransferOutcome::Skipped { reason } => Some(reason.message().to_string()),
            TransferOutcome::Failed { error, .. } => Some(error.clone()),
        }
    }

    /// State an item ends in with this outcome
    pub fn terminal_state(&self) -> ItemState {
        match self {
            TransferOutcome::Success { .. } => ItemState::Succeeded,
            TransferOutcome::Skipped { .. } => ItemState::Skipped,
            TransferOutcome::Failed { .. } => ItemState::Failed,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Success { rows } => write!(f, "success ({rows} rows)"),
            TransferOutcome::Skipped { reason } => write!(f, "skipped ({})", reason.as_str()),
            TransferOutcome::Failed { error, .. } => write!(f, "failed: {error}"),
        }
    }
}

/// Lifecycle of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Not started
    Pending,
    /// Row count being looked up
    Prefetching,
    /// Pages being streamed
    Transferring,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Finished without transferring
    Skipped,
}

impl ItemState {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::Skipped
        )
    }

    /// Whether `self -> next` is legal
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (Pending, Prefetching) | (Pending, Transferring) | (Prefetching, Transferring) => true,
            (_, n) => n.is_terminal(),
        }
    }
}

/// Enforces legal state transitions for one item
#[derive(Debug, Clone)]
pub struct ItemTracker {
    identifier: String,
    state: ItemState,
}

impl ItemTracker {
    /// New tracker in [`ItemState::Pending`]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: ItemState::Pending,
        }
    }

    /// Current state
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: ItemState) -> Result<(), DownloadError> {
        if !self.state.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition {
                identifier: self.identifier.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the terminal outcome; a second call fails
    pub fn finish(&mut self, outcome: &TransferOutcome) -> Result<(), DownloadError> {
        self.transition(outcome.terminal_state())
    }
}

/// Everything known about one finished item
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// The item, with its prefetched count
    pub item: WorkItem,
    /// Terminal outcome
    pub outcome: TransferOutcome,
    /// Data rows on disk for this item (including resumed rows)
    pub rows_written: u64,
    /// Transfer attempts made (0 when nothing was fetched)
    pub attempts: u32,
    /// Where the data lives, if any file was produced
    pub output_path: Option<PathBuf>,
    /// Wall time spent on the item
    pub duration: Duration,
}

impl TransferReport {
    /// Report for an item that never ran
    pub fn not_started(item: WorkItem, outcome: TransferOutcome) -> Self {
        Self {
            item,
            outcome,
            rows_written: 0,
            attempts: 0,
            output_path: None,
            duration: Duration::ZERO,
        }
    }
}
