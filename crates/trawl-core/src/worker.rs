use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::DedupCache;
use crate::error::{AppError, FetchErrorClass};
use crate::identity::IdentityRotator;
use crate::job::{FetchJob, JobState, RetryConfig};
use crate::job_queue::TargetQueue;
use crate::models::{CacheEntry, CacheStatus, Record};
use crate::summary::RunCounters;
use crate::throttle::RateLimiter;
use crate::traits::{CacheStore, FetcherFactory, PageFetcher, RecordExtractor, ResultSink};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    JobSkipped {
        worker_id: &'a str,
        target: &'a str,
        status: CacheStatus,
    },
    JobStarted {
        worker_id: &'a str,
        target: &'a str,
        attempt: u32,
        proxy: Option<&'a str>,
    },
    JobSucceeded {
        worker_id: &'a str,
        target: &'a str,
        attempts: u32,
    },
    RetryScheduled {
        worker_id: &'a str,
        target: &'a str,
        attempt: u32,
        delay: Duration,
        error: &'a str,
    },
    JobFailed {
        worker_id: &'a str,
        target: &'a str,
        status: CacheStatus,
        attempts: u32,
        error: &'a str,
    },
    JobReleased {
        worker_id: &'a str,
        target: &'a str,
    },
    FetcherRestarted {
        worker_id: &'a str,
        error: &'a str,
    },
    Stopped {
        worker_id: &'a str,
        jobs_processed: u64,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::JobSkipped {
                worker_id,
                target,
                status,
            } => {
                tracing::debug!(%worker_id, target_key = %target, %status, "Already resolved, skipping");
            }
            WorkerEvent::JobStarted {
                worker_id,
                target,
                attempt,
                proxy,
            } => {
                tracing::info!(%worker_id, target_key = %target, attempt, ?proxy, "Fetching");
            }
            WorkerEvent::JobSucceeded {
                worker_id,
                target,
                attempts,
            } => {
                tracing::info!(%worker_id, target_key = %target, attempts, "Job succeeded");
            }
            WorkerEvent::RetryScheduled {
                worker_id,
                target,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    %worker_id,
                    target_key = %target,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    %error,
                    "Fetch failed, retry scheduled"
                );
            }
            WorkerEvent::JobFailed {
                worker_id,
                target,
                status,
                attempts,
                error,
            } => {
                tracing::warn!(%worker_id, target_key = %target, %status, attempts, %error, "Job failed");
            }
            WorkerEvent::JobReleased { worker_id, target } => {
                tracing::info!(%worker_id, target_key = %target, "Job released on shutdown");
            }
            WorkerEvent::FetcherRestarted { worker_id, error } => {
                tracing::warn!(%worker_id, %error, "Fetcher unusable, recreated");
            }
            WorkerEvent::Stopped {
                worker_id,
                jobs_processed,
            } => {
                tracing::info!(%worker_id, jobs_processed, "Worker stopped");
            }
        }
    }
}

/// State shared by every worker in a pool.
///
/// The cache index and the rotation cursor are the only pieces mutated
/// across workers; both synchronise internally.
pub struct PoolContext<E, K, S>
where
    E: RecordExtractor,
    K: ResultSink,
    S: CacheStore,
{
    pub queue: TargetQueue,
    pub cache: Arc<DedupCache<S>>,
    pub limiter: RateLimiter,
    pub rotator: IdentityRotator,
    pub extractor: E,
    pub sink: K,
    pub retry: RetryConfig,
    pub fetch_timeout: Duration,
    pub counters: RunCounters,
}

impl<E, K, S> PoolContext<E, K, S>
where
    E: RecordExtractor,
    K: ResultSink,
    S: CacheStore,
{
    /// Write the terminal cache entry for a job. A store failure is a run
    /// warning; the entry stays in memory for the final flush.
    pub async fn write_entry(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        if let Err(e) = self.cache.put_async(entry).await {
            self.counters
                .warn(format!("cache write for '{key}' deferred to final flush: {e}"));
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// One member of the pool: pulls jobs and drives each through the fetch
/// state machine. Owns its page fetcher exclusively.
pub struct Worker<FF, E, K, S>
where
    FF: FetcherFactory,
    E: RecordExtractor,
    K: ResultSink,
    S: CacheStore,
{
    id: String,
    factory: Arc<FF>,
    ctx: Arc<PoolContext<E, K, S>>,
}

impl<FF, E, K, S> Worker<FF, E, K, S>
where
    FF: FetcherFactory,
    E: RecordExtractor,
    K: ResultSink,
    S: CacheStore,
{
    pub fn new(id: impl Into<String>, factory: Arc<FF>, ctx: Arc<PoolContext<E, K, S>>) -> Self {
        Self {
            id: id.into(),
            factory,
            ctx,
        }
    }

    /// Run the worker loop until the queue drains or `cancel` fires.
    ///
    /// Returns the number of jobs this worker took off the queue. Fails only
    /// if the worker could not obtain a fetcher at all.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel: &CancellationToken,
        reporter: &WR,
    ) -> Result<u64, AppError> {
        reporter.report(WorkerEvent::Started { worker_id: &self.id });

        let mut fetcher = match self.factory.create().await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(worker_id = %self.id, error = %e, "Failed to create fetcher");
                reporter.report(WorkerEvent::Stopped {
                    worker_id: &self.id,
                    jobs_processed: 0,
                });
                return Err(e);
            }
        };

        let mut processed = 0u64;
        while let Some(job) = self.ctx.queue.pull(cancel).await {
            processed += 1;
            match self.process_job(job, &mut fetcher, cancel, reporter).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }

        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.id,
            jobs_processed: processed,
        });
        Ok(processed)
    }

    async fn process_job<WR: WorkerReporter>(
        &self,
        mut job: FetchJob,
        fetcher: &mut FF::Fetcher,
        cancel: &CancellationToken,
        reporter: &WR,
    ) -> Flow {
        let ctx = &self.ctx;

        // Pending: resolved targets are never fetched again.
        if let Some(entry) = ctx.cache.lookup(job.key())
            && entry.status.is_resolved()
        {
            reporter.report(WorkerEvent::JobSkipped {
                worker_id: &self.id,
                target: job.key(),
                status: entry.status,
            });
            ctx.counters.record_skipped();
            ctx.queue.complete();
            return Flow::Continue;
        }

        if ctx.limiter.wait(&self.id, cancel).await.is_err() {
            if job.attempt == 0 {
                reporter.report(WorkerEvent::JobReleased {
                    worker_id: &self.id,
                    target: job.key(),
                });
                ctx.counters.record_released(1);
                ctx.queue.release(job);
            } else {
                let error = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "cancelled before retry".to_string());
                self.finish_failed(job, CacheStatus::TransientFailure, &error, reporter).await;
            }
            return Flow::Stop;
        }

        let identity = ctx.rotator.next();
        job.attempt += 1;
        job.transition(JobState::Fetching);
        ctx.counters.record_fetch_attempt();
        reporter.report(WorkerEvent::JobStarted {
            worker_id: &self.id,
            target: job.key(),
            attempt: job.attempt,
            proxy: identity.proxy.as_deref(),
        });

        let timeout = ctx.fetch_timeout;
        let fetched = tokio::select! {
            result = tokio::time::timeout(timeout, fetcher.fetch(&job.target, &identity, timeout)) => {
                result.unwrap_or(Err(AppError::Timeout(timeout.as_secs())))
            }
            () = cancel.cancelled() => Err(AppError::Cancelled),
        };

        let error = match fetched {
            Ok(raw) => {
                job.transition(JobState::Extracting);
                self.extract_and_emit(job, &raw, reporter).await;
                return Flow::Continue;
            }
            Err(e) => e,
        };

        let message = error.to_string();
        job.last_error = Some(message.clone());

        if error.is_cancelled() {
            self.finish_failed(
                job,
                CacheStatus::TransientFailure,
                "cancelled during fetch",
                reporter,
            )
            .await;
            return Flow::Stop;
        }

        match error.fetch_class() {
            FetchErrorClass::Permanent => {
                self.finish_failed(job, CacheStatus::PermanentFailure, &message, reporter).await;
            }
            FetchErrorClass::Retryable => {
                let delay = ctx.retry.delay_for_attempt(job.attempt);
                self.retry_or_exhaust(job, delay, &message, reporter).await;
            }
            FetchErrorClass::Fatal => {
                ctx.counters.record_fetcher_restart();
                match self.recreate_fetcher(cancel).await {
                    Ok(fresh) => {
                        *fetcher = fresh;
                        reporter.report(WorkerEvent::FetcherRestarted {
                            worker_id: &self.id,
                            error: &message,
                        });
                        self.retry_or_exhaust(job, Duration::ZERO, &message, reporter).await;
                    }
                    Err(e) => {
                        tracing::error!(worker_id = %self.id, error = %e, "Giving up on fetcher recreation");
                        self.finish_failed(
                            job,
                            CacheStatus::TransientFailure,
                            &message,
                            reporter,
                        )
                        .await;
                        return Flow::Stop;
                    }
                }
            }
        }
        Flow::Continue
    }

    async fn extract_and_emit<WR: WorkerReporter>(&self, job: FetchJob, raw: &str, reporter: &WR) {
        let ctx = &self.ctx;

        let record = match ctx.extractor.extract(&job.target, raw) {
            Ok(record) => record,
            Err(e) => {
                // Parse rules may be stale; recorded, not retried this run.
                let message = e.to_string();
                self.finish_failed(job, CacheStatus::TransientFailure, &message, reporter).await;
                return;
            }
        };

        if let Err(e) = ctx.sink.append(&record).await {
            let message = format!("result sink rejected record: {e}");
            self.finish_failed(job, CacheStatus::TransientFailure, &message, reporter).await;
            return;
        }

        self.finish_succeeded(job, record, reporter).await;
    }

    async fn retry_or_exhaust<WR: WorkerReporter>(
        &self,
        job: FetchJob,
        delay: Duration,
        message: &str,
        reporter: &WR,
    ) {
        if job.can_retry(&self.ctx.retry) {
            reporter.report(WorkerEvent::RetryScheduled {
                worker_id: &self.id,
                target: job.key(),
                attempt: job.attempt,
                delay,
                error: message,
            });
            self.ctx.queue.schedule_retry(job, delay);
        } else {
            self.finish_failed(job, CacheStatus::TransientFailure, message, reporter).await;
        }
    }

    async fn finish_succeeded<WR: WorkerReporter>(&self, mut job: FetchJob, record: Record, reporter: &WR) {
        job.transition(JobState::Succeeded);
        reporter.report(WorkerEvent::JobSucceeded {
            worker_id: &self.id,
            target: job.key(),
            attempts: job.attempt,
        });
        self.ctx
            .write_entry(CacheEntry::success(record, job.attempt))
            .await;
        self.ctx.counters.record_success();
        self.ctx.queue.complete();
    }

    async fn finish_failed<WR: WorkerReporter>(
        &self,
        mut job: FetchJob,
        status: CacheStatus,
        error: &str,
        reporter: &WR,
    ) {
        job.transition(JobState::Failed);
        reporter.report(WorkerEvent::JobFailed {
            worker_id: &self.id,
            target: job.key(),
            status,
            attempts: job.attempt,
            error,
        });
        self.ctx
            .write_entry(CacheEntry::failure(job.key(), status, error, job.attempt))
            .await;
        match status {
            CacheStatus::PermanentFailure => self.ctx.counters.record_permanent_failure(),
            _ => self.ctx.counters.record_transient_failure(),
        }
        self.ctx.queue.complete();
    }

    /// Ask the factory for a replacement fetcher, backing off between tries.
    async fn recreate_fetcher(&self, cancel: &CancellationToken) -> Result<FF::Fetcher, AppError> {
        let retry = &self.ctx.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.factory.create().await {
                Ok(fetcher) => return Ok(fetcher),
                Err(e) if attempt >= retry.max_retries => return Err(e),
                Err(e) => {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        worker_id = %self.id,
                        attempt,
                        error = %e,
                        "Fetcher recreation failed, backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(AppError::Cancelled),
                    }
                }
            }
        }
    }
}
