//! Transfer execution and scheduling
//!
//! This module turns work items into CSV files and outcomes.
//!
//! # Overview
//!
//! 1. **Scheduling**: [`scheduler::DownloadScheduler`] prefetches row counts,
//!    runs small datasets sequentially and large ones on a bounded pool
//! 2. **Execution**: [`executor::TransferExecutor`] streams one dataset into
//!    its CSV file, retrying from the last completed page
//! 3. **Outcomes**: [`job::TransferOutcome`] and [`job::ItemTracker`] guarantee
//!    exactly one terminal outcome per item
//! 4. **Progress**: [`progress::ProgressState`] formats periodic progress lines
//! 5. **Rate Limiting**: [`rate_limit::RateLimiter`] throttles requests
//!
//! # Quick Start
//!
//! ```no_run
//! use healthcare_data_downloader::downloader::{DownloaderConfig, TransferExecutor};
//! use healthcare_data_downloader::fetcher::cms_http::CmsApiClient;
//! use healthcare_data_downloader::WorkItem;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let config = DownloaderConfig::default();
//! let client = Arc::new(CmsApiClient::with_defaults(&config.base_url));
//! let executor = TransferExecutor::new(config, client);
//!
//! let item = WorkItem::new("9767cb68-8ea9-4f0b-8179-9431abc89f11", "Hospital General Information");
//! let report = executor.execute(&item, None).await;
//! println!("{}: {}", item.identifier, report.outcome);
//! # }
//! ```
//!
//! # Error Handling
//!
//! Per-item errors never escape an item: they become a
//! [`job::TransferOutcome::Failed`] carrying the message and HTTP status.
//! Network, 429 and 5xx failures are retried according to
//! [`config::RetryPolicy`].

pub mod config;
pub mod executor;
pub mod job;
pub mod progress;
pub mod rate_limit;
pub mod scheduler;

pub use config::{DownloaderConfig, RetryPolicy};
pub use executor::TransferExecutor;
pub use job::{ItemState, ItemTracker, SkipReason, TransferOutcome, TransferReport};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use scheduler::{DownloadScheduler, RunSummary};

use crate::fetcher::FetcherError;
use crate::output::OutputError;

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// HTTP or network failure while fetching pages
    #[error("{message}")]
    Transport {
        /// HTTP status, `None` for network-level failures
        status: Option<u16>,
        /// Error description
        message: String,
    },

    /// Response body could not be interpreted
    #[error("parse error: {0}")]
    Parse(String),

    /// Writing the CSV failed
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// Blob store check or upload failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Operator asked to skip the item
    #[error("skipped by operator")]
    Skipped,

    /// Process shutdown requested
    #[error("shutdown requested")]
    Shutdown,

    /// Illegal item state transition
    #[error("invalid transition for {identifier}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Item identifier
        identifier: String,
        /// Current state
        from: ItemState,
        /// Requested state
        to: ItemState,
    },
}

impl DownloadError {
    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            DownloadError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether restarting the transfer may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transport { status: None, .. } => true,
            DownloadError::Transport {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<FetcherError> for DownloadError {
    fn from(err: FetcherError) -> Self {
        match err {
            FetcherError::Parse(msg) => DownloadError::Parse(msg),
            other => DownloadError::Transport {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}
