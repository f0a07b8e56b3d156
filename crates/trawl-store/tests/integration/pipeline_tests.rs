use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use trawl_core::models::CacheStatus;
use trawl_core::testutil::{MockExtractor, MockFetcher, MockFetcherFactory, MockReporter};
use trawl_core::{AppError, Orchestrator};
use trawl_store::{CsvSink, JsonlCacheStore};

use crate::integration::common::{fast_config, targets, workspace};

const FIELDS: [&str; 1] = ["body"];

fn csv_rows(path: &std::path::Path) -> Vec<csv::StringRecord> {
    csv::Reader::from_path(path)
        .unwrap()
        .records()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn second_run_fetches_nothing_already_resolved() {
    let ws = workspace();
    let keys = ["a/one", "a/two", "a/gone", "a/flaky"];

    let first_fetcher = MockFetcher::new("<html>project</html>")
        .with_script("a/gone", vec![Err(AppError::NotFound("a/gone".into()))])
        .with_script(
            "a/flaky",
            vec![
                Err(AppError::Timeout(30)),
                Err(AppError::Timeout(30)),
                Err(AppError::Timeout(30)),
            ],
        );
    let first = Orchestrator::new(
        fast_config(2),
        MockFetcherFactory::new(first_fetcher.clone()),
        MockExtractor::new(),
        CsvSink::create(&ws.output_path, &FIELDS).unwrap(),
        JsonlCacheStore::new(&ws.cache_path),
    )
    .unwrap();
    let summary = first
        .run(targets(&keys), CancellationToken::new(), Arc::new(MockReporter::new()))
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.permanent_failures, 1);
    assert_eq!(summary.transient_failures, 1);
    assert_eq!(first_fetcher.calls_for("a/flaky"), 3);

    let second_fetcher = MockFetcher::new("<html>project</html>");
    let second = Orchestrator::new(
        fast_config(2),
        MockFetcherFactory::new(second_fetcher.clone()),
        MockExtractor::new(),
        CsvSink::create(&ws.output_path, &FIELDS).unwrap(),
        JsonlCacheStore::new(&ws.cache_path),
    )
    .unwrap();
    let summary = second
        .run(targets(&keys), CancellationToken::new(), Arc::new(MockReporter::new()))
        .await
        .unwrap();

    // Only the transient failure is tried again.
    assert_eq!(second_fetcher.total_calls(), 1);
    assert_eq!(second_fetcher.calls_for("a/flaky"), 1);
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.succeeded, 1);

    let rows = csv_rows(&ws.output_path);
    assert_eq!(rows.len(), 3);
    let mut targets_written: Vec<_> = rows.iter().map(|r| r[0].to_string()).collect();
    targets_written.sort();
    assert_eq!(targets_written, ["a/flaky", "a/one", "a/two"]);

    let cache_lines = fs::read_to_string(&ws.cache_path).unwrap();
    assert_eq!(cache_lines.lines().count(), keys.len());
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_persists_in_flight_jobs() {
    let ws = workspace();
    let fetcher = MockFetcher::new("<html>project</html>").with_delay(Duration::from_secs(60));
    let orchestrator = Orchestrator::new(
        fast_config(2).with_fetch_timeout(Duration::from_secs(300)),
        MockFetcherFactory::new(fetcher.clone()),
        MockExtractor::new(),
        CsvSink::create(&ws.output_path, &FIELDS).unwrap(),
        JsonlCacheStore::new(&ws.cache_path),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let summary = orchestrator
        .run(
            targets(&["a/one", "a/two", "a/three"]),
            cancel,
            Arc::new(MockReporter::new()),
        )
        .await
        .unwrap();

    assert_eq!(fetcher.total_calls(), 2);
    assert_eq!(summary.transient_failures, 2);
    assert_eq!(summary.released, 1);

    let reopened = JsonlCacheStore::new(&ws.cache_path);
    let entries = trawl_core::traits::CacheStore::load(&reopened).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(
        entries
            .iter()
            .all(|e| e.status == CacheStatus::TransientFailure)
    );
    assert!(csv_rows(&ws.output_path).is_empty());
}
