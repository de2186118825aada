use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use graderd::dispatch::RunSink;
use graderd::error::GraderError;
use graderd::monitor::{FailureReason, InflightMonitor};
use graderd::queue::{EventHub, Priority, QueueEvent, Run, RunQueue, Verdict};

/// Sink that records every terminal disposition it receives.
#[derive(Default)]
struct RecordingSink {
    completed: Mutex<Vec<(Uuid, u32, Verdict)>>,
    abandoned: Mutex<Vec<(Uuid, u32)>>,
}

#[async_trait]
impl RunSink for RecordingSink {
    async fn completed(&self, run: &Run, verdict: &Verdict) {
        self.completed
            .lock()
            .unwrap()
            .push((run.id(), run.attempts, verdict.clone()));
    }

    async fn abandoned(&self, run: &Run) {
        self.abandoned
            .lock()
            .unwrap()
            .push((run.id(), run.attempts));
    }
}

struct Fixture {
    queue: Arc<RunQueue>,
    monitor: Arc<InflightMonitor>,
    sink: Arc<RecordingSink>,
    events: Arc<EventHub>,
}

fn fixture(max_retries: u32) -> Fixture {
    let events = Arc::new(EventHub::new());
    let queue = Arc::new(RunQueue::new(1024, events.clone()));
    let sink = Arc::new(RecordingSink::default());
    let monitor = Arc::new(InflightMonitor::new(
        queue.clone(),
        events.clone(),
        sink.clone(),
        max_retries,
    ));
    Fixture {
        queue,
        monitor,
        sink,
        events,
    }
}

fn test_run() -> Run {
    Run::new(
        "int main() {}".to_string(),
        "cpp17".to_string(),
        "bundle-b".to_string(),
        Priority::Normal,
    )
}

fn accepted() -> Verdict {
    Verdict {
        verdict: "AC".to_string(),
        score: 100.0,
        max_score: 100.0,
        runtime_ms: 120,
        memory_bytes: 4 << 20,
    }
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(60)
}

#[tokio::test]
async fn register_tracks_the_attempt() {
    let f = fixture(3);
    let run = test_run();
    let run_id = run.id();

    f.monitor.register(run, "runner-1", far_deadline()).unwrap();

    assert_eq!(f.monitor.len(), 1);
    let snapshot = f.monitor.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].run_id, run_id);
    assert_eq!(snapshot[0].worker, "runner-1");
    assert_eq!(snapshot[0].attempts, 1);
    assert!(snapshot[0].remaining_ms > 0);
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let f = fixture(3);
    let id = Uuid::new_v4();
    let first = Run::with_id(
        id,
        "x".to_string(),
        "py3".to_string(),
        "bundle-b".to_string(),
        Priority::Normal,
    );
    let second = Run::with_id(
        id,
        "x".to_string(),
        "py3".to_string(),
        "bundle-b".to_string(),
        Priority::Normal,
    );

    f.monitor.register(first, "runner-1", far_deadline()).unwrap();
    let refused = f
        .monitor
        .register(second, "runner-2", far_deadline())
        .unwrap_err();

    assert!(matches!(refused.error, GraderError::DuplicateAttempt(i) if i == id));
    assert_eq!(refused.run.id(), id);
    assert_eq!(f.monitor.len(), 1);
}

#[tokio::test]
async fn complete_hands_the_verdict_to_the_sink() {
    let f = fixture(3);
    let run = test_run();
    let run_id = run.id();

    f.monitor.register(run, "runner-1", far_deadline()).unwrap();
    f.monitor.complete(run_id, accepted()).await.unwrap();

    assert_eq!(f.monitor.len(), 0);
    let completed = f.sink.completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, run_id);
    assert_eq!(completed[0].2.verdict, "AC");
}

#[tokio::test]
async fn completing_an_untracked_run_is_an_error() {
    let f = fixture(3);
    let err = f.monitor.complete(Uuid::new_v4(), accepted()).await;
    assert!(matches!(err, Err(GraderError::RunNotFound(_))));
}

#[tokio::test]
async fn failed_run_is_reenqueued_at_high_priority() {
    let f = fixture(3);
    let (tx, mut rx) = mpsc::channel(16);
    f.events.add_listener(tx);

    let run = test_run();
    let run_id = run.id();
    f.monitor.register(run, "runner-1", far_deadline()).unwrap();
    f.monitor
        .fail(run_id, &FailureReason::Worker("connection reset".to_string()))
        .await
        .unwrap();

    assert_eq!(f.monitor.len(), 0);
    assert_eq!(f.queue.len_by_priority(Priority::High), 1);
    let retried = f.queue.try_pop().unwrap();
    assert_eq!(retried.id(), run_id);
    assert_eq!(retried.attempts, 1);

    let mut saw_retried = false;
    while let Ok(event) = rx.try_recv() {
        if let QueueEvent::Retried { run_id: id, attempts } = event {
            assert_eq!(id, run_id);
            assert_eq!(attempts, 1);
            saw_retried = true;
        }
    }
    assert!(saw_retried);
}

#[tokio::test]
async fn fourth_failure_abandons_with_max_retries_three() {
    let f = fixture(3);
    let (tx, mut rx) = mpsc::channel(64);
    f.events.add_listener(tx);

    let run = test_run();
    let run_id = run.id();
    f.monitor.register(run, "runner-1", far_deadline()).unwrap();

    for expected_attempts in 1..=3u32 {
        f.monitor
            .fail(run_id, &FailureReason::DeadlineExceeded)
            .await
            .unwrap();
        let retried = f.queue.try_pop().unwrap();
        assert_eq!(retried.attempts, expected_attempts);
        assert_eq!(retried.priority, Priority::High);
        f.monitor
            .register(retried, "runner-1", far_deadline())
            .unwrap();
    }

    // Fourth attempt fails: the budget is exhausted.
    f.monitor
        .fail(run_id, &FailureReason::DeadlineExceeded)
        .await
        .unwrap();

    assert!(f.queue.is_empty());
    assert_eq!(f.monitor.len(), 0);
    let abandoned = f.sink.abandoned.lock().unwrap();
    assert_eq!(abandoned.as_slice(), &[(run_id, 4)]);

    let mut retried_events = 0;
    let mut abandoned_events = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            QueueEvent::Retried { .. } => retried_events += 1,
            QueueEvent::Abandoned { attempts, .. } => {
                assert_eq!(attempts, 4);
                abandoned_events += 1;
            }
            _ => {}
        }
    }
    assert_eq!(retried_events, 3);
    assert_eq!(abandoned_events, 1);
}

#[tokio::test]
async fn deadline_sweep_fails_expired_attempts() {
    let f = fixture(3);
    let run = test_run();
    let run_id = run.id();

    // Deadline already in the past.
    f.monitor
        .register(run, "runner-1", Instant::now())
        .unwrap();

    let shutdown = CancellationToken::new();
    let sweeper = {
        let monitor = f.monitor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            monitor
                .run_sweep(Duration::from_millis(10), shutdown)
                .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    sweeper.await.unwrap();

    assert_eq!(f.monitor.len(), 0);
    let retried = f.queue.try_pop().unwrap();
    assert_eq!(retried.id(), run_id);
    assert_eq!(retried.priority, Priority::High);
}

#[tokio::test]
async fn cancelled_run_is_abandoned_instead_of_retried() {
    let f = fixture(3);
    let run = test_run();
    let run_id = run.id();

    f.monitor.register(run, "runner-1", far_deadline()).unwrap();
    f.monitor.cancel(run_id).unwrap();
    f.monitor
        .fail(run_id, &FailureReason::Worker("killed".to_string()))
        .await
        .unwrap();

    // Budget was nowhere near exhausted, but cancellation wins.
    assert!(f.queue.is_empty());
    assert_eq!(f.sink.abandoned.lock().unwrap().as_slice(), &[(run_id, 1)]);
}

#[tokio::test]
async fn cancelled_run_that_completes_still_reports_a_verdict() {
    let f = fixture(3);
    let run = test_run();
    let run_id = run.id();

    f.monitor.register(run, "runner-1", far_deadline()).unwrap();
    f.monitor.cancel(run_id).unwrap();
    f.monitor.complete(run_id, accepted()).await.unwrap();

    assert_eq!(f.sink.completed.lock().unwrap().len(), 1);
    assert!(f.sink.abandoned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_an_untracked_run_is_an_error() {
    let f = fixture(3);
    assert!(f.monitor.cancel(Uuid::new_v4()).is_err());
}

#[tokio::test]
async fn dispatch_failure_counts_against_the_budget() {
    let f = fixture(0);
    let run = test_run();
    let run_id = run.id();

    // With a zero budget, the first failed dispatch abandons immediately.
    f.monitor
        .fail_dispatch(
            run,
            &FailureReason::BundleUnavailable("store unreachable".to_string()),
        )
        .await;

    assert!(f.queue.is_empty());
    assert_eq!(f.sink.abandoned.lock().unwrap().as_slice(), &[(run_id, 1)]);
}
