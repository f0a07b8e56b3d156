use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{CacheEntry, Identity, Record, Target};

/// Retrieves the raw content of a target's page.
///
/// Errors must be classifiable via [`AppError::fetch_class`]: retryable
/// (timeouts, resets, rate limiting), permanent (target not found), or
/// fatal (the fetcher itself is unusable and must be recreated).
pub trait PageFetcher: Send + Sync {
    fn fetch(
        &self,
        target: &Target,
        identity: &Identity,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Creates page fetchers. Each worker owns the fetcher it gets from here
/// and asks for a new one after a fatal fetcher error.
pub trait FetcherFactory: Send + Sync + 'static {
    type Fetcher: PageFetcher + 'static;

    fn create(&self) -> impl Future<Output = Result<Self::Fetcher, AppError>> + Send;
}

/// Turns raw page content into a structured record.
pub trait RecordExtractor: Send + Sync + Clone + 'static {
    fn extract(&self, target: &Target, raw_content: &str) -> Result<Record, AppError>;
}

/// Durable, append-only output of extracted records.
///
/// `append` may be called concurrently; each record must land completely or
/// not at all.
pub trait ResultSink: Send + Sync + 'static {
    fn append(&self, record: &Record) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Flush and sync everything appended so far. Idempotent.
    fn finish(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persistence backend behind the dedup cache.
pub trait CacheStore: Send + Sync + 'static {
    /// Load every persisted entry. Later entries for a key win.
    fn load(&self) -> Result<Vec<CacheEntry>, AppError>;

    /// Incrementally persist entries on top of what is already stored.
    fn append(&self, entries: &[CacheEntry]) -> Result<(), AppError>;

    /// Atomically replace the persisted state with exactly `entries`.
    fn snapshot(&self, entries: &[CacheEntry]) -> Result<(), AppError>;
}

/// A no-op ResultSink for runs that only care about the cache.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    async fn append(&self, _record: &Record) -> Result<(), AppError> {
        Ok(())
    }

    async fn finish(&self) -> Result<(), AppError> {
        Ok(())
    }
}
