use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{GraderError, Result};
use crate::queue::events::{EventHub, QueueEvent};
use crate::queue::run::{Priority, Run, RunState};

/// Returned by `push` when the queue is at capacity; gives the run back to
/// the caller so it can be disposed of rather than silently dropped.
#[derive(Debug)]
pub struct QueueFull(pub Run);

#[derive(Debug, Default)]
struct Lanes {
    lanes: [VecDeque<Run>; 4],
    total: usize,
}

/// Priority-segregated FIFO queue of runs awaiting a worker.
///
/// Four independent lanes, one per priority class; `pop` scans lanes in
/// fixed priority order and takes the first non-empty lane's head. All lane
/// mutation happens under a single internal lock; queue events are published
/// after the lock is released so a slow listener can never block a producer.
#[derive(Debug)]
pub struct RunQueue {
    inner: Mutex<Lanes>,
    notify: Notify,
    events: Arc<EventHub>,
    max_runs: usize,
}

impl RunQueue {
    pub fn new(max_runs: usize, events: Arc<EventHub>) -> Self {
        Self {
            inner: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            events,
            max_runs,
        }
    }

    /// Enqueue a run on its priority lane.
    ///
    /// Emits a manager-added event. At capacity the run is handed back
    /// inside [`QueueFull`].
    pub fn push(&self, mut run: Run) -> std::result::Result<(), QueueFull> {
        debug_assert_eq!(run.state, RunState::Queued);
        let run_id = run.id();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.total >= self.max_runs {
                return Err(QueueFull(run));
            }
            run.enqueued_at = Instant::now();
            let lane = run.priority.lane();
            inner.lanes[lane].push_back(run);
            inner.total += 1;
        }
        self.events.publish(QueueEvent::ManagerAdded { run_id });
        self.notify.notify_one();
        Ok(())
    }

    /// Remove and return the highest-priority, oldest-enqueued run, or
    /// `None` if all lanes are empty.
    pub fn try_pop(&self) -> Option<Run> {
        let run = {
            let mut inner = self.inner.lock().unwrap();
            let mut popped = None;
            for priority in Priority::DISPATCH_ORDER {
                if let Some(run) = inner.lanes[priority.lane()].pop_front() {
                    popped = Some(run);
                    break;
                }
            }
            let run = popped?;
            inner.total -= 1;
            if inner.total > 0 {
                // Keep waking poppers while work remains; a Notify stores at
                // most one permit.
                self.notify.notify_one();
            }
            run
        };

        let wait = run.enqueued_at.elapsed();
        self.events.publish(QueueEvent::ManagerRemoved {
            run_id: run.id(),
            wait,
        });
        self.events.publish(QueueEvent::QueueRemoved {
            run_id: run.id(),
            wait,
            priority: run.priority,
        });
        Some(run)
    }

    /// Remove and return the highest-priority, oldest-enqueued run,
    /// waiting if all lanes are empty.
    pub async fn pop(&self) -> Run {
        loop {
            if let Some(run) = self.try_pop() {
                return run;
            }
            self.notify.notified().await;
        }
    }

    /// Withdraw a still-queued run from its lane.
    ///
    /// No queue events are emitted for a cancellation; the returned run
    /// carries the cancellation marker.
    pub fn cancel(&self, run_id: Uuid) -> Result<Run> {
        let mut inner = self.inner.lock().unwrap();
        let found = inner.lanes.iter().enumerate().find_map(|(lane, queue)| {
            queue
                .iter()
                .position(|r| r.id() == run_id)
                .map(|pos| (lane, pos))
        });
        match found {
            Some((lane, pos)) => {
                let mut run = inner.lanes[lane].remove(pos).expect("position is in bounds");
                run.cancel_requested = true;
                inner.total -= 1;
                Ok(run)
            }
            None => Err(GraderError::RunNotFound(run_id)),
        }
    }

    /// Register a consumer of queue events. Delivery is best-effort and
    /// never blocks queue operations.
    pub fn add_event_listener(&self, tx: tokio::sync::mpsc::Sender<QueueEvent>) {
        self.events.add_listener(tx);
    }

    /// Total number of queued runs.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued runs in a single priority lane.
    pub fn len_by_priority(&self, priority: Priority) -> usize {
        self.inner.lock().unwrap().lanes[priority.lane()].len()
    }
}
