use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority class of a run. Dequeue order is strict:
/// High > Normal > Low > Ephemeral, FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Ephemeral,
    Low,
    Normal,
    High,
}

impl Priority {
    /// Lane scan order used by `Pop`.
    pub const DISPATCH_ORDER: [Priority; 4] = [
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Ephemeral,
    ];

    /// Index of this priority's lane in the lane table.
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::Ephemeral => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Ephemeral => "ephemeral",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a run.
///
/// Valid transitions:
/// `Queued -> Dispatched -> {Completed | Failed}`,
/// `Failed -> Queued` (retry under budget) or `Failed -> Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Dispatched,
    Completed,
    Failed,
    Abandoned,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::Dispatched => "dispatched",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// The immutable submission half of a run, shared with the worker
/// transport while an attempt is in flight.
#[derive(Debug, Serialize)]
pub struct RunPayload {
    pub id: Uuid,
    pub source: String,
    pub language: String,
    /// Content-addressed identifier of the test-case bundle.
    pub bundle_id: String,
    pub created_at: DateTime<Utc>,
}

/// A unit of grading work.
///
/// The scheduling half is mutable and owned by exactly one component at a
/// time (queue, monitor, or the terminal path); `Run` is deliberately not
/// `Clone`.
#[derive(Debug)]
pub struct Run {
    payload: Arc<RunPayload>,
    pub priority: Priority,
    /// Number of dispatch attempts started for this run.
    pub attempts: u32,
    pub state: RunState,
    /// Set when a caller withdraws the run mid-attempt; suppresses retries.
    pub cancel_requested: bool,
    pub(crate) enqueued_at: Instant,
}

impl Run {
    pub fn new(source: String, language: String, bundle_id: String, priority: Priority) -> Self {
        Self::with_id(Uuid::new_v4(), source, language, bundle_id, priority)
    }

    pub fn with_id(
        id: Uuid,
        source: String,
        language: String,
        bundle_id: String,
        priority: Priority,
    ) -> Self {
        Self {
            payload: Arc::new(RunPayload {
                id,
                source,
                language,
                bundle_id,
                created_at: Utc::now(),
            }),
            priority,
            attempts: 0,
            state: RunState::Queued,
            cancel_requested: false,
            enqueued_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.payload.id
    }

    pub fn bundle_id(&self) -> &str {
        &self.payload.bundle_id
    }

    pub fn payload(&self) -> &Arc<RunPayload> {
        &self.payload
    }
}

/// Grading outcome returned by a worker for a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Short verdict code, e.g. "AC", "WA", "TLE".
    pub verdict: String,
    pub score: f64,
    pub max_score: f64,
    pub runtime_ms: u64,
    pub memory_bytes: u64,
}
