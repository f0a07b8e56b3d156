//! Per-worker request pacing.
//!
//! Each worker waits `interval ± jitter` between its own requests. Workers
//! are paced independently; the worker count bounds the aggregate rate.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use trawl_core::throttle::{RateLimitConfig, RateLimiter};
//!
//! # async fn run() -> Result<(), trawl_core::AppError> {
//! let limiter = RateLimiter::new(
//!     RateLimitConfig::new(Duration::from_secs(2)).with_jitter(Duration::from_secs(1)),
//! );
//! let cancel = CancellationToken::new();
//! limiter.wait("worker-0", &cancel).await?; // first call returns immediately
//! limiter.wait("worker-0", &cancel).await?; // sleeps 1..=3 seconds
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Configuration for the per-worker rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Nominal delay between consecutive requests from one worker.
    pub interval: Duration,

    /// Maximum random deviation from `interval`, in both directions.
    ///
    /// Set to `Duration::ZERO` for a fixed cadence.
    pub jitter: Duration,
}

impl RateLimitConfig {
    /// Create a new config with the given interval and no jitter.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Smallest delay a single wait can produce.
    pub fn min_delay(&self) -> Duration {
        self.interval.saturating_sub(self.jitter)
    }

    /// Draw the delay for one wait, uniform in `[interval - jitter, interval + jitter]`.
    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let low = self.min_delay();
        let high = self.interval + self.jitter;
        let ms = rand::rng().random_range(low.as_millis() as u64..=high.as_millis() as u64);
        Duration::from_millis(ms).max(low)
    }
}

impl Default for RateLimitConfig {
    /// 2 seconds ± 1 second.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            jitter: Duration::from_secs(1),
        }
    }
}

/// Paces each worker's own requests.
///
/// Tracks when each worker's previous `wait` returned. Only that worker
/// ever reads or writes its slot, so the map lock is never held across a
/// sleep.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    last_release: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_release: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspend until this worker may issue its next request.
    ///
    /// Returns `AppError::Cancelled` as soon as `cancel` fires; a cancelled
    /// wait leaves the worker's timer untouched.
    pub async fn wait(&self, worker_id: &str, cancel: &CancellationToken) -> Result<(), AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        let last = self.lock_map().get(worker_id).copied();
        if let Some(last) = last {
            let required = self.config.effective_delay();
            let elapsed = last.elapsed();
            if elapsed < required {
                let sleep_duration = required - elapsed;
                tracing::debug!(
                    %worker_id,
                    sleep_ms = %sleep_duration.as_millis(),
                    "Throttling request"
                );
                tokio::select! {
                    () = tokio::time::sleep(sleep_duration) => {}
                    () = cancel.cancelled() => return Err(AppError::Cancelled),
                }
            }
        }

        self.lock_map().insert(worker_id.to_string(), Instant::now());
        Ok(())
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.last_release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_delay_without_jitter() {
        let config = RateLimitConfig::new(Duration::from_secs(1));
        assert_eq!(config.effective_delay(), Duration::from_secs(1));
    }

    #[test]
    fn effective_delay_with_jitter_is_bounded() {
        let config =
            RateLimitConfig::new(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..200 {
            let d = config.effective_delay();
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn jitter_larger_than_interval_clamps_at_zero() {
        let config =
            RateLimitConfig::new(Duration::from_millis(10)).with_jitter(Duration::from_millis(50));
        assert_eq!(config.min_delay(), Duration::ZERO);
        for _ in 0..50 {
            assert!(config.effective_delay() <= Duration::from_millis(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_wait_returns_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.wait("w0", &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_waits_respect_min_delay() {
        let config =
            RateLimitConfig::new(Duration::from_millis(200)).with_jitter(Duration::from_millis(100));
        let min = config.min_delay();
        let limiter = RateLimiter::new(config);
        let cancel = CancellationToken::new();

        limiter.wait("w0", &cancel).await.unwrap();
        let mut previous = Instant::now();
        for _ in 0..20 {
            limiter.wait("w0", &cancel).await.unwrap();
            let now = Instant::now();
            assert!(
                now - previous >= min,
                "waits returned {:?} apart, expected at least {min:?}",
                now - previous
            );
            previous = now;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn workers_are_paced_independently() {
        let limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(1)));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.wait("w0", &cancel).await.unwrap();
        limiter.wait("w1", &cancel).await.unwrap();
        limiter.wait("w2", &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.wait("w0", &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_wait() {
        let limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        limiter.wait("w0", &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = limiter.wait("w0", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn default_config_matches_one_to_three_seconds() {
        let config = RateLimitConfig::default();
        assert_eq!(config.min_delay(), Duration::from_secs(1));
        assert_eq!(config.interval + config.jitter, Duration::from_secs(3));
    }
}
