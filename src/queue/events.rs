use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::queue::run::Priority;

/// An observability record of a queue or run state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A run entered the queue manager.
    ManagerAdded { run_id: Uuid },
    /// A run left the queue manager; `wait` is dequeue time minus enqueue time.
    ManagerRemoved { run_id: Uuid, wait: Duration },
    /// A run left its priority lane.
    QueueRemoved {
        run_id: Uuid,
        wait: Duration,
        priority: Priority,
    },
    /// A failed run was re-enqueued under the retry budget.
    Retried { run_id: Uuid, attempts: u32 },
    /// A run exhausted its retry budget (or was withdrawn).
    Abandoned { run_id: Uuid, attempts: u32 },
}

/// Fan-out of queue events to registered listeners.
///
/// Delivery is fire-and-forget: a listener whose buffer is full has the
/// event dropped rather than stalling the producer. Closed listeners are
/// pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventHub {
    listeners: Mutex<Vec<mpsc::Sender<QueueEvent>>>,
    dropped: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, tx: mpsc::Sender<QueueEvent>) {
        self.listeners.lock().unwrap().push(tx);
    }

    pub fn publish(&self, event: QueueEvent) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| !tx.is_closed());
        for tx in listeners.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("grader_queue_events_dropped").increment(1);
                tracing::trace!(?event, "Queue event dropped, listener buffer full");
            }
        }
    }

    /// Number of events dropped because a listener's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
