use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use trawl_core::job::RetryConfig;
use trawl_core::models::{DEFAULT_BASE_URL, Target};
use trawl_core::throttle::RateLimitConfig;
use trawl_core::RunConfig;
use url::Url;

/// Fresh working directory with cache and output paths inside it.
///
/// Keep the `TempDir` alive for the duration of the test.
pub struct Workspace {
    pub dir: TempDir,
    pub cache_path: PathBuf,
    pub output_path: PathBuf,
}

pub fn workspace() -> Workspace {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cache_path = dir.path().join("scrape_cache.jsonl");
    let output_path = dir.path().join("github_projects.csv");
    Workspace {
        dir,
        cache_path,
        output_path,
    }
}

/// Run config with no inter-request delay and millisecond backoff.
pub fn fast_config(workers: usize) -> RunConfig {
    RunConfig::default()
        .with_workers(workers)
        .with_rate_limit(RateLimitConfig::new(Duration::ZERO))
        .with_retry(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
        .with_cache_flush_every(2)
}

pub fn targets(keys: &[&str]) -> Vec<Target> {
    let base = Url::parse(DEFAULT_BASE_URL).unwrap();
    keys.iter()
        .map(|k| Target::parse(k, &base).unwrap())
        .collect()
}
