//! Graceful shutdown during a run

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use healthcare_data_downloader::downloader::rate_limit::RateLimiter;
use healthcare_data_downloader::downloader::scheduler::NOT_STARTED_MESSAGE;
use healthcare_data_downloader::downloader::{DownloadScheduler, DownloaderConfig, RetryPolicy};
use healthcare_data_downloader::fetcher::cms_http::CmsApiClient;
use healthcare_data_downloader::output::OutputPaths;
use healthcare_data_downloader::runlog::{read_log, FlushPolicy, RunLogger};
use healthcare_data_downloader::shutdown::ShutdownCoordinator;
use healthcare_data_downloader::WorkItem;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn shutdown_race_condition_no_deadlock() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let handle = shutdown.clone();
    let waiter = tokio::spawn(async move {
        handle.wait_for_shutdown().await;
        true
    });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
    assert!(result.is_ok(), "wait_for_shutdown() deadlocked despite shutdown already requested");
}

#[tokio::test]
async fn shutdown_mid_run_records_every_item() {
    let server = MockServer::start().await;
    let page: Vec<_> = (0..10).map(|i| json!({"id": i, "state": "WA"})).collect();
    Mock::given(method("GET"))
        .and(path("/slow/data"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page)
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = DownloaderConfig {
        output_dir: dir.path().join("data"),
        page_size: 10,
        retry: RetryPolicy::no_retry(),
        ..Default::default()
    };
    let client = Arc::new(
        CmsApiClient::new(
            Arc::new(reqwest::Client::new()),
            server.uri(),
            Arc::new(RateLimiter::unlimited()),
        )
        .with_max_retries(0),
    );
    let logger = RunLogger::spawn(dir.path().join("run.json"), FlushPolicy::default());
    let shutdown = ShutdownCoordinator::shared();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            shutdown.request_shutdown();
        }
    });

    let slow = WorkItem::new("slow", "Slow Dataset");
    let items = vec![
        slow.clone(),
        WorkItem::new("next-1", "Next One"),
        WorkItem::new("next-2", "Next Two"),
    ];
    let summary = DownloadScheduler::new(config.clone(), client.clone(), client, logger.sink())
        .with_shutdown(shutdown)
        .run(items)
        .await;

    assert_eq!(summary.total, 3);
    assert_eq!(summary.failed, 3);

    let first = &summary.reports[0];
    assert_eq!(first.item.identifier, "slow");
    assert_eq!(first.rows_written, 10);
    let part = OutputPaths::for_item(&config.output_dir, &slow).part_path;
    assert_eq!(std::fs::read_to_string(part).unwrap().lines().count(), 11);

    for report in &summary.reports[1..] {
        assert_eq!(report.outcome.message().as_deref(), Some(NOT_STARTED_MESSAGE));
    }

    let log_path = logger.path().to_path_buf();
    assert_eq!(logger.close().await.unwrap(), 3);
    assert_eq!(read_log(&log_path).unwrap().len(), 3);
}
