//! # Healthcare Data Downloader Library
//!
//! A resumable bulk downloader for publicly hosted healthcare datasets. Built
//! around the CMS dataset catalog REST API, it streams every dataset's
//! paginated JSON endpoint into a CSV file and keeps a durable JSON log of
//! per-dataset outcomes.
//!
//! ## Features
//!
//! - **Paginated Streaming**: offset/size pagination with short-page end detection
//! - **Lazy CSV Output**: files are only created once data arrives, headers are
//!   inferred from the first record
//! - **Row-Count Prefetch**: expected sizes drive progress reporting and triage
//! - **Scheduling**: small datasets run sequentially, large ones on a bounded pool
//! - **Operator Skip**: type `s` (or `s <identifier>`) to abandon a transfer
//! - **Resume**: finished files are never re-fetched, partial files continue
//!   from their last whole page
//! - **Durable Run Log**: JSON log flushed in batches, on failures and on exit
//!
//! ## Quick Start
//!
//! ```no_run
//! use healthcare_data_downloader::downloader::{DownloadScheduler, DownloaderConfig};
//! use healthcare_data_downloader::fetcher::cms_http::CmsApiClient;
//! use healthcare_data_downloader::runlog::RunLogger;
//! use healthcare_data_downloader::WorkItem;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DownloaderConfig::default();
//! let client = Arc::new(CmsApiClient::with_defaults(&config.base_url));
//! let logger = RunLogger::spawn(config.log_path("example"), Default::default());
//!
//! let scheduler = DownloadScheduler::new(config, client.clone(), client, logger.sink());
//! let items = vec![WorkItem::new("9767cb68-8ea9-4f0b-8179-9431abc89f11", "Hospital General Information")];
//! let summary = scheduler.run(items).await;
//! logger.close().await?;
//!
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`worklist`] - Work list loading and validation
//! - [`fetcher`] - Page fetching, pagination and row-count prefetch
//! - [`output`] - Streaming CSV writer and output naming
//! - [`downloader`] - Per-item transfer executor and the scheduler
//! - [`skip`] - Interactive operator skip commands
//! - [`runlog`] - Durable JSON run log
//! - [`storage`] - Optional blob store uploads

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};

/// CLI command implementations
pub mod cli;

/// Transfer execution and scheduling
pub mod downloader;

/// Page fetchers
pub mod fetcher;

/// Observability metrics
pub mod metrics;

/// Output writers
pub mod output;

/// Durable run log
pub mod runlog;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

/// Operator skip commands
pub mod skip;

/// Blob store uploads
pub mod storage;

/// Work list input
pub mod worklist;

/// One record of a dataset page: column name to scalar value, in API order.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A dataset scheduled for download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    /// Opaque dataset key (e.g. a CMS dataset UUID)
    pub identifier: String,
    /// Display name
    pub title: String,
    /// Free-text notes (dataset description)
    #[serde(default)]
    pub notes: String,
    /// Landing page the dataset was discovered on
    #[serde(default)]
    pub source_url: Option<String>,
    /// Expected total rows, unknown until prefetched
    #[serde(default)]
    pub expected_rows: Option<u64>,
}

impl WorkItem {
    /// Create a work item with no notes and an unknown row count
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            notes: String::new(),
            source_url: None,
            expected_rows: None,
        }
    }

    /// Return a copy carrying the given expected row count
    pub fn with_expected_rows(&self, expected_rows: Option<u64>) -> Self {
        Self {
            expected_rows,
            ..self.clone()
        }
    }

    /// Human-friendly label used in console output
    pub fn label(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.identifier
        } else {
            &self.title
        }
    }
}

/// One bounded batch of records returned by the paginated endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    /// Records in API order
    pub records: Vec<Record>,
    /// Offset this page was requested at
    pub offset: u64,
    /// True when fewer records than requested came back
    pub is_final: bool,
}

impl PageResult {
    /// Build a page, deriving `is_final` from the requested page size
    pub fn new(records: Vec<Record>, offset: u64, requested_size: u64) -> Self {
        let is_final = (records.len() as u64) < requested_size;
        Self {
            records,
            offset,
            is_final,
        }
    }

    /// Number of records in the page
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the page carries no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offset of the page that follows this one
    pub fn next_offset(&self) -> u64 {
        self.offset + self.records.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: u64) -> Record {
        json!({ "id": id }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_page_result_final_detection() {
        let full = PageResult::new(vec![record(1), record(2)], 0, 2);
        assert!(!full.is_final);
        assert_eq!(full.next_offset(), 2);

        let short = PageResult::new(vec![record(3)], 2, 2);
        assert!(short.is_final);
        assert_eq!(short.next_offset(), 3);

        let empty = PageResult::new(vec![], 4, 2);
        assert!(empty.is_final);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_work_item_label_falls_back_to_identifier() {
        let item = WorkItem::new("abc-123", "  ");
        assert_eq!(item.label(), "abc-123");

        let titled = WorkItem::new("abc-123", "Hospital Enrollments");
        assert_eq!(titled.label(), "Hospital Enrollments");
    }

    #[test]
    fn test_with_expected_rows_keeps_original() {
        let item = WorkItem::new("abc", "Title");
        let sized = item.with_expected_rows(Some(42));
        assert_eq!(item.expected_rows, None);
        assert_eq!(sized.expected_rows, Some(42));
        assert_eq!(sized.identifier, "abc");
    }
}
