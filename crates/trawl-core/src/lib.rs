pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod job_queue;
pub mod models;
pub mod orchestrator;
pub mod summary;
pub mod throttle;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{CacheStats, DedupCache};
pub use config::RunConfig;
pub use error::{AppError, FetchErrorClass};
pub use identity::{IdentityRotator, RotationPolicy};
pub use job::RetryConfig;
pub use models::{CacheEntry, CacheStatus, Identity, Record, Target, compute_hash};
pub use orchestrator::Orchestrator;
pub use summary::RunSummary;
pub use throttle::{RateLimitConfig, RateLimiter};
pub use traits::{CacheStore, FetcherFactory, PageFetcher, RecordExtractor, ResultSink};
pub use worker::{TracingWorkerReporter, WorkerReporter};
