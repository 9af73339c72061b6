//! Row-count prefetch
//!
//! Expected dataset sizes come from the `data-viewer/stats` endpoint. A
//! missing or unreadable count never blocks a transfer: it simply becomes
//! `None` and the dataset is treated as small.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::fetcher::cms_http::CmsApiClient;
use crate::fetcher::FetcherResult;
use crate::WorkItem;

/// Locations of the row count in a stats document, first hit wins
const COUNT_PATHS: &[&[&str]] = &[
    &["data", "total_rows"],
    &["total_rows"],
    &["data", "found_rows"],
    &["found_rows"],
];

/// Row-count lookup capability
#[async_trait]
pub trait RowCountSource: Send + Sync {
    /// Expected total rows of `identifier`, `None` when unknown
    async fn row_count(&self, identifier: &str) -> Option<u64>;
}

#[async_trait]
impl RowCountSource for CmsApiClient {
    async fn row_count(&self, identifier: &str) -> Option<u64> {
        let url = self.dataset_url(identifier, "data-viewer/stats");
        let body: FetcherResult<Value> =
            self.get_json(&url, &[], "stats", self.stats_retries()).await;

        match body {
            Ok(doc) => {
                let count = extract_row_count(&doc);
                if count.is_none() {
                    debug!(identifier = identifier, "Stats response has no row count");
                }
                count
            }
            Err(e) => {
                warn!(identifier = identifier, error = %e, "Row count prefetch failed");
                None
            }
        }
    }
}

/// Find the row count in a stats document
pub fn extract_row_count(doc: &Value) -> Option<u64> {
    COUNT_PATHS.iter().find_map(|path| {
        let value = path.iter().try_fold(doc, |node, key| node.get(*key))?;
        as_count(value)
    })
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().replace(',', "").parse::<u64>().ok(),
        _ => None,
    }
}

/// Attach expected row counts to every item, keeping input order
///
/// Items that already carry a count (e.g. from the work list) are not
/// looked up again.
pub async fn prefetch_row_counts(
    source: Arc<dyn RowCountSource>,
    items: Vec<WorkItem>,
    concurrency: usize,
) -> Vec<WorkItem> {
    stream::iter(items)
        .map(|item| {
            let source = source.clone();
            async move {
                if item.expected_rows.is_some() {
                    return item;
                }
                let count = source.row_count(&item.identifier).await;
                debug!(
                    identifier = %item.identifier,
                    expected_rows = ?count,
                    "Row count prefetched"
                );
                item.with_expected_rows(count)
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}
