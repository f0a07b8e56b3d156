use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use uuid::Uuid;

/// Counters shared by all workers of one run.
#[derive(Debug, Default)]
pub struct RunCounters {
    succeeded: AtomicU64,
    permanent_failures: AtomicU64,
    transient_failures: AtomicU64,
    skipped: AtomicU64,
    released: AtomicU64,
    fetch_attempts: AtomicU64,
    fetcher_restarts: AtomicU64,
    warnings: Mutex<Vec<String>>,
}

impl RunCounters {
    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_failure(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self, n: u64) {
        self.released.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_fetch_attempt(&self) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetcher_restart(&self) {
        self.fetcher_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(%message, "Run warning");
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }

    pub fn summary(&self, run_id: Uuid, elapsed: Duration) -> RunSummary {
        RunSummary {
            run_id,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            fetcher_restarts: self.fetcher_restarts.load(Ordering::Relaxed),
            warnings: self
                .warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            elapsed,
        }
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub succeeded: u64,
    pub permanent_failures: u64,
    /// Retry budget exhausted, extraction failed, or cut short by cancellation.
    pub transient_failures: u64,
    /// Already resolved in the cache; not fetched.
    pub skipped: u64,
    /// Never attempted because the run was cancelled first.
    pub released: u64,
    pub fetch_attempts: u64,
    pub fetcher_restarts: u64,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Jobs that reached a terminal state in this run.
    pub fn terminal(&self) -> u64 {
        self.succeeded + self.permanent_failures + self.transient_failures
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} completed in {:.2}s", self.run_id, self.elapsed.as_secs_f64())?;
        writeln!(f, "  succeeded:          {}", self.succeeded)?;
        writeln!(f, "  permanent failures: {}", self.permanent_failures)?;
        writeln!(f, "  transient failures: {}", self.transient_failures)?;
        writeln!(f, "  skipped (cached):   {}", self.skipped)?;
        writeln!(f, "  released:           {}", self.released)?;
        write!(f, "  fetch attempts:     {}", self.fetch_attempts)?;
        for warning in &self.warnings {
            write!(f, "\n  warning: {warning}")?;
        }
        Ok(())
    }
}
