//! Dataset page fetchers

use crate::PageResult;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

pub mod cms_http;
pub mod pagination;
pub mod shared_resources;
pub mod stats;

/// Fetcher errors
#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    /// Connection, timeout or body-read failure
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Response could not be interpreted as a page
    #[error("parse error: {0}")]
    Parse(String),

    /// Rate limited (429) after all request-level retries
    #[error("rate limit exceeded")]
    RateLimit,
}

impl FetcherError {
    /// HTTP status code attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            FetcherError::Http { status, .. } => Some(*status),
            FetcherError::RateLimit => Some(429),
            _ => None,
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetcherError::Network(_) | FetcherError::RateLimit => true,
            FetcherError::Http { status, .. } => *status == 429 || *status >= 500,
            FetcherError::Parse(_) => false,
        }
    }
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// Lazy sequence of pages for one dataset
pub type PageStream = Pin<Box<dyn Stream<Item = FetcherResult<PageResult>> + Send>>;

/// Page-fetch capability of a paginated dataset endpoint
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch up to `size` records of `identifier` starting at `offset`
    ///
    /// A page with fewer than `size` records is the last one.
    async fn fetch_page(&self, identifier: &str, offset: u64, size: u64)
        -> FetcherResult<PageResult>;
}
