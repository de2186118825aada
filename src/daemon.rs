use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{BundleFactory, InputCache};
use crate::config::GraderConfig;
use crate::dispatch::{Dispatcher, RunSink, WorkerPool, WorkerTransport};
use crate::error::{GraderError, Result};
use crate::monitor::InflightMonitor;
use crate::queue::run::{Priority, Run, RunState};
use crate::queue::{EventHub, QueueEvent, RunQueue};
use crate::status::{run_status_server, StatusState};

/// The grading dispatch daemon: owns the run queue, the in-flight monitor,
/// the input cache, and the worker pool, and wires them together.
pub struct Grader {
    config: Arc<GraderConfig>,
    events: Arc<EventHub>,
    queue: Arc<RunQueue>,
    monitor: Arc<InflightMonitor>,
    cache: Arc<InputCache>,
    pool: Arc<WorkerPool>,
    sink: Arc<dyn RunSink>,
}

impl Grader {
    pub fn new(
        config: Arc<GraderConfig>,
        factory: Arc<dyn BundleFactory>,
        sink: Arc<dyn RunSink>,
    ) -> Self {
        let events = Arc::new(EventHub::new());
        let queue = Arc::new(RunQueue::new(config.queue.max_runs, events.clone()));
        let monitor = Arc::new(InflightMonitor::new(
            queue.clone(),
            events.clone(),
            sink.clone(),
            config.monitor.max_grade_retries,
        ));
        let cache = Arc::new(InputCache::new(config.cache.size_bytes, factory));

        Self {
            config,
            events,
            queue,
            monitor,
            cache,
            pool: Arc::new(WorkerPool::new()),
            sink,
        }
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<InflightMonitor> {
        &self.monitor
    }

    pub fn cache(&self) -> &Arc<InputCache> {
        &self.cache
    }

    /// Make a worker connection available to the dispatch loop.
    pub fn register_worker(&self, worker: Arc<dyn WorkerTransport>) {
        self.pool.register(worker);
    }

    /// Register an external consumer of queue events.
    pub fn add_event_listener(&self, tx: mpsc::Sender<QueueEvent>) {
        self.events.add_listener(tx);
    }

    /// Submit a run for grading. Returns its ID.
    pub fn submit(
        &self,
        source: String,
        language: String,
        bundle_id: String,
        priority: Priority,
    ) -> Result<Uuid> {
        let run = Run::new(source, language, bundle_id, priority);
        let run_id = run.id();
        self.queue
            .push(run)
            .map_err(|_full| GraderError::QueueFull)?;
        tracing::info!(run_id = %run_id, priority = %priority, "Run submitted");
        Ok(run_id)
    }

    /// Withdraw a run. A still-queued run is removed immediately; a
    /// dispatched run resolves its current attempt first and is then
    /// abandoned instead of retried.
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        match self.queue.cancel(run_id) {
            Ok(mut run) => {
                run.state = RunState::Abandoned;
                tracing::info!(run_id = %run_id, "Queued run withdrawn");
                self.sink.abandoned(&run).await;
                Ok(())
            }
            Err(GraderError::RunNotFound(_)) => self.monitor.cancel(run_id),
            Err(e) => Err(e),
        }
    }

    /// Warm the cache from the runtime directory.
    pub async fn preload(&self) -> Result<usize> {
        self.cache.preload(&self.config.cache.cache_dir()).await
    }

    /// Spawn all subsystem tasks and park until shutdown:
    /// the dispatch loop, the deadline sweep, the queue-metrics processor,
    /// and (when configured) the status server.
    pub async fn run(&self, shutdown: CancellationToken) {
        let (metrics_tx, metrics_rx) =
            mpsc::channel(self.config.queue.event_channel_length);
        self.events.add_listener(metrics_tx);
        tokio::spawn(crate::metrics::run_queue_metrics(metrics_rx));

        let monitor = self.monitor.clone();
        let sweep_interval = Duration::from_millis(self.config.monitor.sweep_interval_ms);
        let sweep_shutdown = shutdown.clone();
        tokio::spawn(async move {
            monitor.run_sweep(sweep_interval, sweep_shutdown).await;
        });

        let dispatcher = Dispatcher::new(
            self.queue.clone(),
            self.cache.clone(),
            self.monitor.clone(),
            self.pool.clone(),
            Duration::from_millis(self.config.monitor.attempt_timeout_ms),
        );
        let dispatch_shutdown = shutdown.clone();
        tokio::spawn(async move {
            dispatcher.run(dispatch_shutdown).await;
        });

        if let Some(port) = self.config.status.port {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let state = StatusState {
                queue: self.queue.clone(),
                monitor: self.monitor.clone(),
                cache: self.cache.clone(),
                events: self.events.clone(),
            };
            tokio::spawn(run_status_server(addr, state));
        }

        shutdown.cancelled().await;
        tracing::info!("Grader shut down");
    }
}
