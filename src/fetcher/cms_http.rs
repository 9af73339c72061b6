//! HTTP client for the CMS dataset API
//!
//! Provides the page fetcher used by every transfer:
//! - `GET <base>/{id}/data?offset=<n>&size=<m>` for pages
//! - `GET <base>/{id}/data-viewer/stats` for row counts (see [`super::stats`])
//! - Politeness throttle shared across transfers
//! - Request-level retry with exponential backoff for 429, 5xx and network errors

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::downloader::config::{calculate_backoff, MAX_RETRIES, STATS_MAX_RETRIES};
use crate::downloader::rate_limit::RateLimiter;
use crate::fetcher::shared_resources::{global_cms_rate_limiter, global_http_client};
use crate::fetcher::{FetcherError, FetcherResult, PageSource};
use crate::metrics::{record_retry_backoff, HttpRequestMetrics};
use crate::shutdown;
use crate::{PageResult, Record};

/// Error bodies are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 1000;

/// Client for the CMS `data-api/v1/dataset` endpoints
#[derive(Clone)]
pub struct CmsApiClient {
    client: Arc<Client>,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
    max_retries: u32,
    stats_retries: u32,
}

impl CmsApiClient {
    /// Create a client
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client
    /// * `base_url` - API base, e.g. `https://data.cms.gov/data-api/v1/dataset`
    /// * `rate_limiter` - Shared politeness limiter
    pub fn new(
        client: Arc<Client>,
        base_url: impl Into<String>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            rate_limiter,
            max_retries: MAX_RETRIES,
            stats_retries: STATS_MAX_RETRIES,
        }
    }

    /// Create a client on the process-wide HTTP client and limiter
    pub fn with_defaults(base_url: impl Into<String>) -> Self {
        Self::new(global_http_client(), base_url, global_cms_rate_limiter())
    }

    /// Override the number of request-level retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the retries for row-count lookups
    pub fn with_stats_retries(mut self, stats_retries: u32) -> Self {
        self.stats_retries = stats_retries;
        self
    }

    /// Retries used for `data-viewer/stats` requests
    pub(crate) fn stats_retries(&self) -> u32 {
        self.stats_retries
    }

    /// API base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn dataset_url(&self, identifier: &str, suffix: &str) -> String {
        format!("{}/{}/{}", self.base_url, identifier.trim(), suffix)
    }

    /// GET a JSON document with throttling and request-level retries
    pub(crate) async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        endpoint: &'static str,
        max_retries: u32,
    ) -> FetcherResult<Value> {
        let mut last_error = None;

        for attempt in 0..=max_retries {
            self.rate_limiter
                .acquire()
                .await
                .map_err(|e| FetcherError::Network(format!("Rate limiter error: {}", e)))?;

            let request_metrics = HttpRequestMetrics::start(endpoint, attempt + 1);
            debug!(url = %url, attempt = attempt + 1, "GET");

            let response = match self.client.get(url).query(params).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    request_metrics.record_network_error();
                    warn!(
                        "Network error on attempt {}/{}: {}",
                        attempt + 1,
                        max_retries + 1,
                        e
                    );
                    last_error = Some(FetcherError::Network(e.to_string()));
                    if self.backoff_before_retry(attempt, max_retries).await {
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            request_metrics.record_complete(status.as_u16());

            if status.as_u16() == 429 || status.is_server_error() {
                let body = read_body(response).await;
                warn!(
                    "Server returned {} on attempt {}/{}",
                    status,
                    attempt + 1,
                    max_retries + 1
                );
                last_error = Some(if status.as_u16() == 429 {
                    FetcherError::RateLimit
                } else {
                    FetcherError::Http {
                        status: status.as_u16(),
                        body,
                    }
                });
                if self.backoff_before_retry(attempt, max_retries).await {
                    continue;
                }
                break;
            }

            // Other non-success statuses are not retried
            if !status.is_success() {
                return Err(FetcherError::Http {
                    status: status.as_u16(),
                    body: read_body(response).await,
                });
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| FetcherError::Network(format!("Failed to read body: {}", e)))?;

            return serde_json::from_slice(&bytes).map_err(|e| {
                FetcherError::Parse(format!("Failed to deserialize response: {}", e))
            });
        }

        Err(last_error
            .unwrap_or_else(|| FetcherError::Network("All retries exhausted".to_string())))
    }

    /// Sleep before the next attempt. Returns false when no retry should follow.
    async fn backoff_before_retry(&self, attempt: u32, max_retries: u32) -> bool {
        if attempt >= max_retries {
            return false;
        }

        let backoff = calculate_backoff(attempt);
        record_retry_backoff(backoff, attempt + 1);
        debug!("Retrying after {:?}", backoff);

        match shutdown::get_global_shutdown() {
            Some(coordinator) => {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => true,
                    _ = coordinator.wait_for_shutdown() => false,
                }
            }
            None => {
                tokio::time::sleep(backoff).await;
                true
            }
        }
    }
}

#[async_trait]
impl PageSource for CmsApiClient {
    async fn fetch_page(
        &self,
        identifier: &str,
        offset: u64,
        size: u64,
    ) -> FetcherResult<PageResult> {
        let url = self.dataset_url(identifier, "data");
        let params = [("offset", offset.to_string()), ("size", size.to_string())];

        let body = self.get_json(&url, &params, "data", self.max_retries).await?;
        let records = parse_page(body)?;

        debug!(
            identifier = identifier,
            offset = offset,
            records = records.len(),
            "Page received"
        );

        Ok(PageResult::new(records, offset, size))
    }
}

/// Interpret a page body: an array of objects, or a single object
pub fn parse_page(body: Value) -> FetcherResult<Vec<Record>> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map),
                other => Err(FetcherError::Parse(format!(
                    "record {} is not an object: {}",
                    i,
                    json_kind(&other)
                ))),
            })
            .collect(),
        Value::Object(map) => Ok(vec![map]),
        other => Err(FetcherError::Parse(format!(
            "expected a JSON array of records, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn read_body(response: reqwest::Response) -> String {
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    text.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
