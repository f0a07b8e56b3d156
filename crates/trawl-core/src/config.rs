use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::AppError;
use crate::identity::RotationPolicy;
use crate::job::RetryConfig;
use crate::models::DEFAULT_BASE_URL;
use crate::throttle::RateLimitConfig;

/// Everything a run needs, built once at start-up and handed to the
/// orchestrator. Nothing reads configuration from anywhere else.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Per-fetch timeout handed to the page fetcher and enforced around it.
    pub fetch_timeout: Duration,
    pub proxies: Vec<String>,
    pub user_agents: Vec<String>,
    pub rotation: RotationPolicy,
    /// Project references are resolved against this URL.
    pub base_url: Url,
    pub cache_path: PathBuf,
    pub output_path: PathBuf,
    /// Dirty cache entries accumulated before a batch append.
    pub cache_flush_every: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            fetch_timeout: Duration::from_secs(30),
            proxies: Vec::new(),
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)".to_string(),
            ],
            rotation: RotationPolicy::RoundRobin,
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            cache_path: PathBuf::from("scrape_cache.jsonl"),
            output_path: PathBuf::from("github_projects.csv"),
            cache_flush_every: 25,
        }
    }
}

impl RunConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_user_agents(mut self, user_agents: Vec<String>) -> Self {
        self.user_agents = user_agents;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    pub fn with_cache_flush_every(mut self, n: usize) -> Self {
        self.cache_flush_every = n;
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.workers == 0 {
            return Err(AppError::ConfigError("workers must be at least 1".into()));
        }
        if self.retry.max_retries == 0 {
            return Err(AppError::ConfigError(
                "max_retries must be at least 1 (it counts the first attempt)".into(),
            ));
        }
        if self.rate_limit.jitter > self.rate_limit.interval {
            return Err(AppError::ConfigError(format!(
                "jitter ({}ms) must not exceed interval ({}ms)",
                self.rate_limit.jitter.as_millis(),
                self.rate_limit.interval.as_millis()
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(AppError::ConfigError("fetch timeout must be positive".into()));
        }
        if self.cache_flush_every == 0 {
            return Err(AppError::ConfigError(
                "cache_flush_every must be at least 1".into(),
            ));
        }
        for proxy in &self.proxies {
            Url::parse(proxy)
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy '{proxy}': {e}")))?;
        }
        if self.user_agents.iter().any(|ua| ua.trim().is_empty()) {
            return Err(AppError::ConfigError("user agents must not be empty".into()));
        }
        Ok(())
    }
}
