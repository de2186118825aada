use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cache::{Bundle, InputCache};
use crate::error::Result;
use crate::monitor::{FailureReason, InflightMonitor};
use crate::queue::run::{Run, RunPayload, RunState, Verdict};
use crate::queue::RunQueue;

/// Handle to a connected worker. The implementor owns connection
/// lifecycle, TLS, and serialization of the run payload and verdict.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Ship the run and its input bundle to the worker and wait for the
    /// verdict. An error means the attempt failed.
    async fn send(&self, run: &RunPayload, bundle: &Bundle) -> Result<Verdict>;
}

/// Receives terminal run dispositions. The implementor owns database
/// writes and downstream broadcast.
#[async_trait]
pub trait RunSink: Send + Sync {
    async fn completed(&self, run: &Run, verdict: &Verdict);
    async fn abandoned(&self, run: &Run);
}

/// Sink that only logs dispositions; stands in where no persistence
/// collaborator is wired up.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl RunSink for LogSink {
    async fn completed(&self, run: &Run, verdict: &Verdict) {
        tracing::info!(
            run_id = %run.id(),
            verdict = %verdict.verdict,
            score = verdict.score,
            attempts = run.attempts,
            "Run finalized"
        );
    }

    async fn abandoned(&self, run: &Run) {
        tracing::warn!(
            run_id = %run.id(),
            attempts = run.attempts,
            "Run abandoned without a verdict"
        );
    }
}

/// Registry of idle worker connections.
pub struct WorkerPool {
    idle: Mutex<VecDeque<Arc<dyn WorkerTransport>>>,
    notify: Notify,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Add a worker to the idle set.
    pub fn register(&self, worker: Arc<dyn WorkerTransport>) {
        tracing::info!(worker = worker.name(), "Worker registered");
        self.idle.lock().unwrap().push_back(worker);
        self.notify.notify_one();
    }

    /// Return a worker to the idle set after an attempt resolves.
    pub fn release(&self, worker: Arc<dyn WorkerTransport>) {
        self.idle.lock().unwrap().push_back(worker);
        self.notify.notify_one();
    }

    /// Take an idle worker, waiting until one is available.
    pub async fn acquire(&self) -> Arc<dyn WorkerTransport> {
        loop {
            {
                let mut idle = self.idle.lock().unwrap();
                if let Some(worker) = idle.pop_front() {
                    if !idle.is_empty() {
                        self.notify.notify_one();
                    }
                    return worker;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

/// The coordinator: pops the highest-priority run, resolves its input
/// bundle through the cache, hands the run to an available worker, and
/// registers the attempt with the in-flight monitor. The attempt itself
/// runs as a spawned task so transport I/O never blocks dispatch.
pub struct Dispatcher {
    queue: Arc<RunQueue>,
    cache: Arc<InputCache>,
    monitor: Arc<InflightMonitor>,
    pool: Arc<WorkerPool>,
    attempt_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RunQueue>,
        cache: Arc<InputCache>,
        monitor: Arc<InflightMonitor>,
        pool: Arc<WorkerPool>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            cache,
            monitor,
            pool,
            attempt_timeout,
        }
    }

    /// Run the dispatch loop until the shutdown token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let run = tokio::select! {
                _ = shutdown.cancelled() => break,
                run = self.queue.pop() => run,
            };

            let bundle = match self.cache.fetch(run.bundle_id()).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    self.monitor
                        .fail_dispatch(run, &FailureReason::BundleUnavailable(e.to_string()))
                        .await;
                    continue;
                }
            };

            let worker = tokio::select! {
                _ = shutdown.cancelled() => {
                    // Shutting down with a run in hand: return it to the queue.
                    self.requeue_on_shutdown(run);
                    break;
                }
                worker = self.pool.acquire() => worker,
            };

            let payload = run.payload().clone();
            let deadline = Instant::now() + self.attempt_timeout;
            if let Err(refused) = self.monitor.register(run, worker.name(), deadline) {
                // Duplicate registration is a programming error; fail the
                // run loudly instead of guessing.
                tracing::error!(
                    run_id = %refused.run.id(),
                    error = %refused.error,
                    "Refusing to dispatch run"
                );
                self.monitor
                    .fail_dispatch(
                        refused.run,
                        &FailureReason::Worker(refused.error.to_string()),
                    )
                    .await;
                self.pool.release(worker);
                continue;
            }

            tracing::info!(
                run_id = %payload.id,
                worker = worker.name(),
                bundle_id = %payload.bundle_id,
                "Run dispatched"
            );

            let monitor = self.monitor.clone();
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let outcome = worker.send(&payload, &bundle).await;
                // The bundle stays pinned for the whole attempt.
                drop(bundle);
                match outcome {
                    Ok(verdict) => {
                        if let Err(e) = monitor.complete(payload.id, verdict).await {
                            tracing::debug!(
                                run_id = %payload.id,
                                error = %e,
                                "Verdict arrived for an attempt no longer tracked"
                            );
                        }
                    }
                    Err(e) => {
                        let reason = FailureReason::Worker(e.to_string());
                        if let Err(e) = monitor.fail(payload.id, &reason).await {
                            tracing::debug!(
                                run_id = %payload.id,
                                error = %e,
                                "Failure reported for an attempt no longer tracked"
                            );
                        }
                    }
                }
                pool.release(worker);
            });
        }
    }

    fn requeue_on_shutdown(&self, run: Run) {
        debug_assert_eq!(run.state, RunState::Queued);
        let run_id = run.id();
        if self.queue.push(run).is_err() {
            tracing::error!(run_id = %run_id, "Dropped run during shutdown, queue at capacity");
        }
    }
}
