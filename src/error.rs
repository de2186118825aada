use thiserror::Error;
use uuid::Uuid;

use crate::queue::run::RunState;

#[derive(Error, Debug)]
pub enum GraderError {
    #[error("run queue is at capacity")]
    QueueFull,

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run {0} already has an active attempt")]
    DuplicateAttempt(Uuid),

    #[error("run {id} is {state}, expected {expected}")]
    InvalidState {
        id: Uuid,
        state: RunState,
        expected: RunState,
    },

    #[error("input cache cannot fit bundle {id} ({size} bytes) within its byte budget")]
    CacheCapacity { id: String, size: u64 },

    #[error("failed to fetch bundle {id}: {reason}")]
    BundleFetch { id: String, reason: String },

    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GraderError>;
