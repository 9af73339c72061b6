//! Row-count prefetch over HTTP

use serde_json::json;
use std::sync::Arc;
use healthcare_data_downloader::downloader::rate_limit::RateLimiter;
use healthcare_data_downloader::fetcher::cms_http::CmsApiClient;
use healthcare_data_downloader::fetcher::stats::{prefetch_row_counts, RowCountSource};
use healthcare_data_downloader::WorkItem;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn stats(server: &MockServer, id: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!("/{id}/data-viewer/stats")))
        .respond_with(response)
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> Arc<CmsApiClient> {
    Arc::new(
        CmsApiClient::new(
            Arc::new(reqwest::Client::new()),
            server.uri(),
            Arc::new(RateLimiter::unlimited()),
        )
        .with_max_retries(0)
        .with_stats_retries(0),
    )
}

#[tokio::test]
async fn test_row_count_shapes() {
    let server = MockServer::start().await;
    stats(&server, "nested", ResponseTemplate::new(200).set_body_json(json!({"data": {"total_rows": 1_250_000}}))).await;
    stats(&server, "flat", ResponseTemplate::new(200).set_body_json(json!({"total_rows": "3,400"}))).await;
    stats(&server, "found", ResponseTemplate::new(200).set_body_json(json!({"found_rows": 12}))).await;
    stats(&server, "empty", ResponseTemplate::new(200).set_body_json(json!({"data": {}}))).await;
    stats(&server, "broken", ResponseTemplate::new(200).set_body_string("<html>")).await;
    stats(&server, "gone", ResponseTemplate::new(404)).await;

    let client = client(&server);
    assert_eq!(client.row_count("nested").await, Some(1_250_000));
    assert_eq!(client.row_count("flat").await, Some(3_400));
    assert_eq!(client.row_count("found").await, Some(12));
    assert_eq!(client.row_count("empty").await, None);
    assert_eq!(client.row_count("broken").await, None);
    assert_eq!(client.row_count("gone").await, None);
}

#[tokio::test]
async fn test_prefetch_keeps_order_and_known_counts() {
    let server = MockServer::start().await;
    stats(&server, "a", ResponseTemplate::new(200).set_body_json(json!({"data": {"total_rows": 5}}))).await;
    stats(&server, "c", ResponseTemplate::new(500)).await;
    Mock::given(method("GET"))
        .and(path("/b/data-viewer/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total_rows": 1})))
        .expect(0)
        .mount(&server)
        .await;

    let items = vec![
        WorkItem::new("a", "A"),
        WorkItem::new("b", "B").with_expected_rows(Some(99)),
        WorkItem::new("c", "C"),
    ];
    let items = prefetch_row_counts(client(&server), items, 2).await;

    let counts: Vec<_> = items.iter().map(|i| (i.identifier.as_str(), i.expected_rows)).collect();
    assert_eq!(counts, vec![("a", Some(5)), ("b", Some(99)), ("c", None)]);
}

#[tokio::test]
async fn test_failing_stats_endpoint_uses_small_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky/data-viewer/stats"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    // Page fetches keep the full budget; the lookup gives up after one retry
    let client = CmsApiClient::new(
        Arc::new(reqwest::Client::new()),
        server.uri(),
        Arc::new(RateLimiter::unlimited()),
    )
    .with_max_retries(5);

    let started = std::time::Instant::now();
    assert_eq!(client.row_count("flaky").await, None);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}
