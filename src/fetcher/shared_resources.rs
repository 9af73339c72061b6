//! Shared resources for all fetcher instances
//!
//! One HTTP client (connection pool) and one politeness limiter are shared
//! by every transfer in the process, so concurrent workers stay within the
//! same request budget against the dataset host.

use once_cell::sync::Lazy;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::downloader::config::{DEFAULT_REQUESTS_PER_WINDOW, RATE_LIMIT_WINDOW};
use crate::downloader::rate_limit::RateLimiter;

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds) - a full page of 5000 records can be large
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 120;

const USER_AGENT: &str = concat!("healthcare-data-downloader/", env!("CARGO_PKG_VERSION"));

/// Global HTTP client shared by all fetcher instances
pub static GLOBAL_HTTP_CLIENT: Lazy<Arc<Client>> = Lazy::new(|| {
    Arc::new(
        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                panic!("FATAL: Failed to build HTTP client: {}. Check system TLS configuration.", e);
            }),
    )
});

/// Global politeness limiter for the dataset API host
pub static GLOBAL_CMS_RATE_LIMITER: Lazy<Arc<RateLimiter>> = Lazy::new(|| {
    Arc::new(RateLimiter::request_based(
        DEFAULT_REQUESTS_PER_WINDOW,
        RATE_LIMIT_WINDOW,
    ))
});

/// Get the global HTTP client
pub fn global_http_client() -> Arc<Client> {
    GLOBAL_HTTP_CLIENT.clone()
}

/// Get the global dataset API rate limiter
pub fn global_cms_rate_limiter() -> Arc<RateLimiter> {
    GLOBAL_CMS_RATE_LIMITER.clone()
}
