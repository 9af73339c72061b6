//! End-to-end downloads against a mocked CMS dataset API

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use healthcare_data_downloader::downloader::rate_limit::RateLimiter;
use healthcare_data_downloader::downloader::{DownloadScheduler, DownloaderConfig, RetryPolicy};
use healthcare_data_downloader::fetcher::cms_http::CmsApiClient;
use healthcare_data_downloader::output::OutputPaths;
use healthcare_data_downloader::runlog::{read_log, FlushPolicy, RunLogger};
use healthcare_data_downloader::shutdown::ShutdownCoordinator;
use healthcare_data_downloader::WorkItem;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAGE_SIZE: u64 = 10;

/// Rows `start..end` of a synthetic provider dataset
fn rows(start: u64, end: u64) -> Value {
    Value::Array(
        (start..end)
            .map(|i| {
                json!({
                    "Rndrng_NPI": format!("{:010}", 1_000_000 + i),
                    "Rndrng_Prvdr_Last_Org_Name": format!("Provider {i}"),
                    "Tot_Benes": i * 3,
                })
            })
            .collect(),
    )
}

async fn mount_page(server: &MockServer, id: &str, offset: u64, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/{id}/data")))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_stats(server: &MockServer, id: &str, total: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/{id}/data-viewer/stats")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"total_rows": total}})))
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
        .with_max_retries(0),
    )
}

fn config(dir: &TempDir, retry: RetryPolicy) -> DownloaderConfig {
    DownloaderConfig {
        output_dir: dir.path().join("data"),
        log_dir: dir.path().join("logs"),
        page_size: PAGE_SIZE,
        retry,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_download_writes_all_pages_and_logs_success() {
    let server = MockServer::start().await;
    mount_stats(&server, "ds-1", 25).await;
    mount_page(&server, "ds-1", 0, rows(0, 10)).await;
    mount_page(&server, "ds-1", 10, rows(10, 20)).await;
    mount_page(&server, "ds-1", 20, rows(20, 25)).await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, RetryPolicy::no_retry());
    let logger = RunLogger::spawn(config.log_path("it"), FlushPolicy::default());
    let client = client(&server);

    let item = WorkItem::new("ds-1", "Medicare Physician & Other Practitioners");
    let summary = DownloadScheduler::new(config.clone(), client.clone(), client, logger.sink())
        .with_shutdown(ShutdownCoordinator::shared())
        .run(vec![item.clone()])
        .await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.rows_written, 25);

    let paths = OutputPaths::for_item(&config.output_dir, &item);
    let csv = std::fs::read_to_string(&paths.final_path).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some("Rndrng_NPI,Rndrng_Prvdr_Last_Org_Name,Tot_Benes")
    );
    assert_eq!(lines.count(), 25);
    assert!(!paths.part_path.exists());

    let log_path = logger.path().to_path_buf();
    logger.close().await.unwrap();
    let entries = read_log(&log_path).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, "success");
    assert_eq!(entries[0].expected_rows, Some(25));
    assert_eq!(entries[0].rows_written, 25);
}

#[tokio::test]
async fn test_server_error_on_second_page_keeps_first_page() {
    let server = MockServer::start().await;
    mount_stats(&server, "ds-2", 30).await;
    mount_page(&server, "ds-2", 0, rows(0, 10)).await;
    Mock::given(method("GET"))
        .and(path("/ds-2/data"))
        .and(query_param("offset", "10"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, RetryPolicy::no_retry());
    let logger = RunLogger::spawn(config.log_path("it"), FlushPolicy::default());
    let client = client(&server);

    let item = WorkItem::new("ds-2", "Hospital Enrollments");
    let summary = DownloadScheduler::new(config.clone(), client.clone(), client, logger.sink())
        .with_shutdown(ShutdownCoordinator::shared())
        .run(vec![item.clone()])
        .await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.reports[0].outcome.status(), Some(500));
    assert_eq!(summary.reports[0].rows_written, 10);

    let paths = OutputPaths::for_item(&config.output_dir, &item);
    assert!(!paths.final_path.exists());
    let partial = std::fs::read_to_string(&paths.part_path).unwrap();
    assert_eq!(partial.lines().count(), 11);

    let log_path = logger.path().to_path_buf();
    logger.close().await.unwrap();
    let entries = read_log(&log_path).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, "failed");
    assert_eq!(entries[0].status_code, Some(500));
}

#[tokio::test]
async fn test_item_retry_resumes_after_last_page() {
    let server = MockServer::start().await;
    mount_stats(&server, "ds-3", 15).await;
    mount_page(&server, "ds-3", 0, rows(0, 10)).await;
    Mock::given(method("GET"))
        .and(path("/ds-3/data"))
        .and(query_param("offset", "10"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_page(&server, "ds-3", 10, rows(10, 15)).await;

    let dir = TempDir::new().unwrap();
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(10),
    };
    let config = config(&dir, retry);
    let logger = RunLogger::spawn(config.log_path("it"), FlushPolicy::default());
    let client = client(&server);

    let item = WorkItem::new("ds-3", "Nursing Homes");
    let summary = DownloadScheduler::new(config.clone(), client.clone(), client, logger.sink())
        .with_shutdown(ShutdownCoordinator::shared())
        .run(vec![item.clone()])
        .await;
    logger.close().await.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.reports[0].attempts, 2);

    let csv = std::fs::read_to_string(OutputPaths::for_item(&config.output_dir, &item).final_path).unwrap();
    let npis: Vec<&str> = csv.lines().skip(1).map(|l| l.split(',').next().unwrap()).collect();
    assert_eq!(npis.len(), 15);
    let unique: HashSet<&str> = npis.iter().copied().collect();
    assert_eq!(unique.len(), 15, "a page was written twice");

    let offset_zero = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/ds-3/data" && r.url.query().unwrap_or("").contains("offset=0&"))
        .count();
    assert_eq!(offset_zero, 1);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing/data"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, RetryPolicy::default());
    let logger = RunLogger::spawn(config.log_path("it"), FlushPolicy::default());
    let client = client(&server);

    let summary = DownloadScheduler::new(config, client.clone(), client, logger.sink())
        .with_shutdown(ShutdownCoordinator::shared())
        .run(vec![WorkItem::new("missing", "Gone")])
        .await;
    logger.close().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.reports[0].outcome.status(), Some(404));
}

#[tokio::test]
async fn test_finished_file_is_not_fetched_again() {
    let server = MockServer::start().await;
    mount_stats(&server, "ds-4", 5).await;
    Mock::given(method("GET"))
        .and(path("/ds-4/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows(0, 5)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, RetryPolicy::no_retry());
    let client = client(&server);
    let item = WorkItem::new("ds-4", "Small");

    for expected_skips in [0, 1] {
        let logger = RunLogger::spawn(config.log_path("it"), FlushPolicy::default());
        let summary = DownloadScheduler::new(config.clone(), client.clone(), client.clone(), logger.sink())
            .with_shutdown(ShutdownCoordinator::shared())
            .run(vec![item.clone()])
            .await;
        logger.close().await.unwrap();
        assert_eq!(summary.skipped, expected_skips);
        assert_eq!(summary.failed, 0);
    }
}
