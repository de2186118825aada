use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::RunSink;
use crate::error::{GraderError, Result};
use crate::queue::events::{EventHub, QueueEvent};
use crate::queue::run::{Priority, Run, RunState, Verdict};
use crate::queue::RunQueue;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The worker returned an error or disconnected.
    Worker(String),
    /// The attempt ran past its deadline.
    DeadlineExceeded,
    /// The run's input bundle could not be produced.
    BundleUnavailable(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Worker(reason) => write!(f, "worker failure: {}", reason),
            FailureReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            FailureReason::BundleUnavailable(reason) => {
                write!(f, "bundle unavailable: {}", reason)
            }
        }
    }
}

/// A single dispatch of a run to a worker.
#[derive(Debug)]
struct Attempt {
    run: Run,
    worker: String,
    started_at: Instant,
    deadline: Instant,
}

/// Read-only view of one active attempt, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSnapshot {
    pub run_id: Uuid,
    pub worker: String,
    pub priority: Priority,
    pub attempts: u32,
    pub elapsed_ms: u64,
    /// Milliseconds until the deadline; 0 when already expired.
    pub remaining_ms: u64,
}

/// Returned by `register` when the monitor refuses an attempt; gives the
/// run back to the caller.
#[derive(Debug)]
pub struct RegisterError {
    pub run: Run,
    pub error: GraderError,
}

/// Tracks every attempt currently executing on a worker, detects
/// non-responsive workers via a periodic deadline sweep, and enforces the
/// retry budget: a failed run is re-enqueued at High priority until the
/// budget is exhausted, then abandoned.
pub struct InflightMonitor {
    inner: Mutex<HashMap<Uuid, Attempt>>,
    queue: Arc<RunQueue>,
    events: Arc<EventHub>,
    sink: Arc<dyn RunSink>,
    max_retries: u32,
}

impl InflightMonitor {
    pub fn new(
        queue: Arc<RunQueue>,
        events: Arc<EventHub>,
        sink: Arc<dyn RunSink>,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            queue,
            events,
            sink,
            max_retries,
        }
    }

    /// Record a new attempt for a run popped from the queue.
    ///
    /// Rejects a run that already has an active attempt, and a run that is
    /// not in the `Queued` state. On success the run's attempt count is
    /// incremented and it transitions to `Dispatched`.
    pub fn register(
        &self,
        mut run: Run,
        worker: &str,
        deadline: Instant,
    ) -> std::result::Result<(), RegisterError> {
        if run.state != RunState::Queued {
            let error = GraderError::InvalidState {
                id: run.id(),
                state: run.state,
                expected: RunState::Queued,
            };
            return Err(RegisterError { run, error });
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&run.id()) {
            let error = GraderError::DuplicateAttempt(run.id());
            return Err(RegisterError { run, error });
        }
        run.attempts += 1;
        run.state = RunState::Dispatched;
        tracing::debug!(
            run_id = %run.id(),
            worker,
            attempt = run.attempts,
            "Attempt registered"
        );
        inner.insert(
            run.id(),
            Attempt {
                run,
                worker: worker.to_string(),
                started_at: Instant::now(),
                deadline,
            },
        );
        Ok(())
    }

    /// Mark an attempt successful and hand the verdict to the run sink.
    pub async fn complete(&self, run_id: Uuid, verdict: Verdict) -> Result<()> {
        let attempt = self
            .inner
            .lock()
            .unwrap()
            .remove(&run_id)
            .ok_or(GraderError::RunNotFound(run_id))?;
        let mut run = attempt.run;
        run.state = RunState::Completed;
        tracing::info!(
            run_id = %run_id,
            worker = %attempt.worker,
            verdict = %verdict.verdict,
            score = verdict.score,
            "Run completed"
        );
        self.sink.completed(&run, &verdict).await;
        Ok(())
    }

    /// Mark an attempt failed: re-enqueue at High priority while the retry
    /// budget allows, otherwise abandon.
    pub async fn fail(&self, run_id: Uuid, reason: &FailureReason) -> Result<()> {
        let attempt = self
            .inner
            .lock()
            .unwrap()
            .remove(&run_id)
            .ok_or(GraderError::RunNotFound(run_id))?;
        let mut run = attempt.run;
        run.state = RunState::Failed;
        tracing::warn!(
            run_id = %run_id,
            worker = %attempt.worker,
            attempt = run.attempts,
            %reason,
            "Attempt failed"
        );
        self.dispose(run, reason).await;
        Ok(())
    }

    /// Apply the failure policy to a run whose dispatch never reached a
    /// worker (e.g. its input bundle could not be fetched). Counts against
    /// the retry budget like any other attempt.
    pub async fn fail_dispatch(&self, mut run: Run, reason: &FailureReason) {
        run.attempts += 1;
        run.state = RunState::Failed;
        tracing::warn!(
            run_id = %run.id(),
            attempt = run.attempts,
            %reason,
            "Dispatch failed before reaching a worker"
        );
        self.dispose(run, reason).await;
    }

    /// Request cancellation of a dispatched run. The current attempt still
    /// resolves; on failure the run is abandoned instead of retried.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner
            .get_mut(&run_id)
            .ok_or(GraderError::RunNotFound(run_id))?;
        attempt.run.cancel_requested = true;
        Ok(())
    }

    async fn dispose(&self, mut run: Run, reason: &FailureReason) {
        let run_id = run.id();
        let attempts = run.attempts;
        if !run.cancel_requested && attempts <= self.max_retries {
            run.state = RunState::Queued;
            run.priority = Priority::High;
            match self.queue.push(run) {
                Ok(()) => {
                    self.events
                        .publish(QueueEvent::Retried { run_id, attempts });
                    return;
                }
                Err(crate::queue::QueueFull(returned)) => {
                    tracing::error!(
                        run_id = %run_id,
                        "Queue at capacity, abandoning run instead of retrying"
                    );
                    run = returned;
                }
            }
        }
        run.state = RunState::Abandoned;
        tracing::warn!(run_id = %run_id, attempts, %reason, "Run abandoned");
        self.events
            .publish(QueueEvent::Abandoned { run_id, attempts });
        self.sink.abandoned(&run).await;
    }

    /// Number of attempts currently executing.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view of all active attempts.
    pub fn snapshot(&self) -> Vec<AttemptSnapshot> {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|attempt| AttemptSnapshot {
                run_id: attempt.run.id(),
                worker: attempt.worker.clone(),
                priority: attempt.run.priority,
                attempts: attempt.run.attempts,
                elapsed_ms: now.duration_since(attempt.started_at).as_millis() as u64,
                remaining_ms: attempt
                    .deadline
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            })
            .collect()
    }

    /// Periodically fail attempts that ran past their deadline. Runs until
    /// the shutdown token is cancelled.
    pub async fn run_sweep(&self, interval: Duration, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let now = Instant::now();
                    let expired: Vec<Uuid> = self
                        .inner
                        .lock()
                        .unwrap()
                        .values()
                        .filter(|a| a.deadline <= now)
                        .map(|a| a.run.id())
                        .collect();
                    for run_id in expired {
                        // The attempt may resolve between the scan and here.
                        if let Err(e) = self.fail(run_id, &FailureReason::DeadlineExceeded).await {
                            tracing::debug!(run_id = %run_id, error = %e, "Expired attempt already resolved");
                        }
                    }
                }
            }
        }
    }
}
