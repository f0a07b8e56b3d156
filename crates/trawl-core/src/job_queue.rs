use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::job::{FetchJob, JobState};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<FetchJob>,
    /// Jobs waiting out a retry backoff, with the instant they become ready.
    delayed: Vec<(Instant, FetchJob)>,
    /// Jobs not yet terminal: ready + delayed + held by a worker.
    outstanding: usize,
}

/// In-memory queue of fetch jobs shared by the worker pool.
///
/// Tracks every job until a worker reports it finished, so `pull` can tell
/// "nothing to do right now" (a retry is pending or a peer may still
/// reschedule) apart from "the run is drained".
#[derive(Debug, Default)]
pub struct TargetQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TargetQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a fresh job.
    pub fn push(&self, job: FetchJob) {
        {
            let mut state = self.lock_state();
            state.outstanding += 1;
            state.ready.push_back(job);
        }
        self.notify.notify_waiters();
    }

    /// Hand a job back for another attempt once `delay` has passed.
    ///
    /// The caller still holds the job as outstanding; it stays outstanding
    /// until some worker finishes it.
    pub fn schedule_retry(&self, mut job: FetchJob, delay: Duration) {
        job.transition(JobState::RetryScheduled);
        {
            let mut state = self.lock_state();
            state.delayed.push((Instant::now() + delay, job));
        }
        self.notify.notify_waiters();
    }

    /// Release a job that was pulled but never attempted, back to pending.
    ///
    /// Used on shutdown; the job is no longer outstanding for this run.
    pub fn release(&self, job: FetchJob) {
        tracing::debug!(target_key = %job.target, "Job released without an attempt");
        self.complete();
    }

    /// Mark one pulled job as finished (terminal or released).
    pub fn complete(&self) {
        {
            let mut state = self.lock_state();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next job.
    ///
    /// Returns `None` once the run is drained (nothing outstanding) or as
    /// soon as `cancel` fires. Jobs left in the queue after cancellation are
    /// collected with [`TargetQueue::drain_remaining`].
    pub async fn pull(&self, cancel: &CancellationToken) -> Option<FetchJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return None;
            }

            let next_ready_at = {
                let mut state = self.lock_state();
                promote_due(&mut state);
                if let Some(mut job) = state.ready.pop_front() {
                    job.transition(JobState::Pending);
                    return Some(job);
                }
                if state.outstanding == 0 {
                    return None;
                }
                state.delayed.iter().map(|(at, _)| *at).min()
            };

            match next_ready_at {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                        () = cancel.cancelled() => return None,
                    }
                }
                None => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Take every job still queued after the pool stopped.
    ///
    /// Returns `(never_started, retry_scheduled)`; both are removed from the
    /// outstanding count.
    pub fn drain_remaining(&self) -> (Vec<FetchJob>, Vec<FetchJob>) {
        let mut state = self.lock_state();
        let ready: Vec<FetchJob> = state.ready.drain(..).collect();
        let delayed: Vec<FetchJob> = state.delayed.drain(..).map(|(_, job)| job).collect();

        let (mut never_started, mut retries) = (Vec::new(), Vec::new());
        for job in ready.into_iter().chain(delayed) {
            if job.attempt == 0 {
                never_started.push(job);
            } else {
                retries.push(job);
            }
        }
        state.outstanding = state
            .outstanding
            .saturating_sub(never_started.len() + retries.len());
        (never_started, retries)
    }

    pub fn outstanding(&self) -> usize {
        self.lock_state().outstanding
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn promote_due(state: &mut QueueState) {
    let now = Instant::now();
    let mut i = 0;
    while i < state.delayed.len() {
        if state.delayed[i].0 <= now {
            let (_, job) = state.delayed.swap_remove(i);
            state.ready.push_back(job);
        } else {
            i += 1;
        }
    }
}
