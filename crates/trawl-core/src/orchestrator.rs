use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::DedupCache;
use crate::config::RunConfig;
use crate::error::AppError;
use crate::identity::IdentityRotator;
use crate::job::FetchJob;
use crate::job_queue::TargetQueue;
use crate::models::{CacheEntry, CacheStatus, Target};
use crate::summary::{RunCounters, RunSummary};
use crate::throttle::RateLimiter;
use crate::traits::{CacheStore, FetcherFactory, RecordExtractor, ResultSink};
use crate::worker::{PoolContext, Worker, WorkerReporter};

/// Runs one batch of targets through a fixed-size worker pool.
///
/// Owns the target queue and the shared pool context. `run` returns only
/// after every started job has reached a terminal state (or been released
/// on cancellation), the cache has been flushed and the sink finished.
pub struct Orchestrator<FF, E, K, S>
where
    FF: FetcherFactory,
    E: RecordExtractor,
    K: ResultSink,
    S: CacheStore,
{
    config: RunConfig,
    factory: Arc<FF>,
    ctx: Arc<PoolContext<E, K, S>>,
    run_id: Uuid,
}

impl<FF, E, K, S> Orchestrator<FF, E, K, S>
where
    FF: FetcherFactory,
    E: RecordExtractor,
    K: ResultSink,
    S: CacheStore,
{
    /// Validate the configuration and load the dedup cache from `store`.
    pub fn new(
        config: RunConfig,
        factory: FF,
        extractor: E,
        sink: K,
        store: S,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let ctx = PoolContext {
            queue: TargetQueue::new(),
            cache: Arc::new(DedupCache::open(store, config.cache_flush_every)),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            rotator: IdentityRotator::new(
                config.proxies.clone(),
                config.user_agents.clone(),
                config.rotation,
            ),
            extractor,
            sink,
            retry: config.retry.clone(),
            fetch_timeout: config.fetch_timeout,
            counters: RunCounters::default(),
        };

        Ok(Self {
            config,
            factory: Arc::new(factory),
            ctx: Arc::new(ctx),
            run_id: Uuid::new_v4(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cache(&self) -> &DedupCache<S> {
        &self.ctx.cache
    }

    /// Process `targets` to completion or until `cancel` fires.
    ///
    /// Duplicate keys are collapsed. Per-target failures never fail the run;
    /// an error is returned only when no worker could start at all.
    pub async fn run<WR>(
        &self,
        targets: Vec<Target>,
        cancel: CancellationToken,
        reporter: Arc<WR>,
    ) -> Result<RunSummary, AppError>
    where
        WR: WorkerReporter + 'static,
    {
        let started = Instant::now();
        let enqueued = self.enqueue(targets);
        tracing::info!(
            run_id = %self.run_id,
            targets = enqueued,
            workers = self.config.workers,
            cached = self.ctx.cache.len(),
            "Starting run"
        );

        let mut pool = JoinSet::new();
        for i in 0..self.config.workers {
            let worker = Worker::new(
                format!("worker-{i}"),
                Arc::clone(&self.factory),
                Arc::clone(&self.ctx),
            );
            let cancel = cancel.clone();
            let reporter = Arc::clone(&reporter);
            pool.spawn(async move { worker.run(&cancel, reporter.as_ref()).await });
        }

        let mut workers_started = 0usize;
        let mut last_start_error = None;
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(Ok(_)) => workers_started += 1,
                Ok(Err(e)) => last_start_error = Some(e),
                Err(join_err) => {
                    // Most likely died holding a job; don't let peers wait for it.
                    workers_started += 1;
                    self.ctx.queue.complete();
                    self.ctx
                        .counters
                        .warn(format!("worker task aborted: {join_err}"));
                }
            }
        }

        self.drain().await;
        self.finalize().await;

        let summary = self.ctx.counters.summary(self.run_id, started.elapsed());
        tracing::info!(
            run_id = %self.run_id,
            succeeded = summary.succeeded,
            permanent_failures = summary.permanent_failures,
            transient_failures = summary.transient_failures,
            skipped = summary.skipped,
            released = summary.released,
            "Run finished"
        );

        match last_start_error {
            Some(e) if workers_started == 0 && enqueued > 0 => Err(e),
            _ => Ok(summary),
        }
    }

    fn enqueue(&self, targets: Vec<Target>) -> usize {
        let mut seen = HashSet::with_capacity(targets.len());
        let mut enqueued = 0;
        for target in targets {
            if !seen.insert(target.key().to_string()) {
                tracing::debug!(target_key = %target, "Duplicate target dropped");
                continue;
            }
            self.ctx.queue.push(FetchJob::new(target));
            enqueued += 1;
        }
        enqueued
    }

    /// Resolve whatever the pool left in the queue after it stopped.
    async fn drain(&self) {
        let (never_started, retries) = self.ctx.queue.drain_remaining();
        if !never_started.is_empty() {
            tracing::info!(count = never_started.len(), "Releasing jobs that never started");
            self.ctx.counters.record_released(never_started.len() as u64);
        }

        for job in retries {
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "cancelled before retry".to_string());
            self.ctx
                .write_entry(CacheEntry::failure(
                    job.key(),
                    CacheStatus::TransientFailure,
                    error,
                    job.attempt,
                ))
                .await;
            self.ctx.counters.record_transient_failure();
        }
    }

    /// Final persistence. Runs regardless of how the pool stopped.
    async fn finalize(&self) {
        match self.ctx.cache.flush_async().await {
            Ok(wrote) => tracing::debug!(wrote, "Final cache flush"),
            Err(e) => self.ctx.counters.warn(format!("final cache flush failed: {e}")),
        }
        if let Err(e) = self.ctx.sink.finish().await {
            self.ctx
                .counters
                .warn(format!("result sink finalisation failed: {e}"));
        }
    }
}
