use tokio::sync::mpsc;

use crate::queue::run::Priority;
use crate::queue::QueueEvent;

/// Translate queue events into the metrics sink.
///
/// Runs until the event channel closes. Queue depth is tracked as a gauge,
/// wait times as histograms (overall and per departed priority), and
/// retries/abandons as counters.
pub async fn run_queue_metrics(mut events: mpsc::Receiver<QueueEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            QueueEvent::ManagerAdded { .. } => {
                metrics::gauge!("grader_queue_total_length").increment(1.0);
            }
            QueueEvent::ManagerRemoved { wait, .. } => {
                metrics::gauge!("grader_queue_total_length").decrement(1.0);
                metrics::histogram!("grader_queue_delay_seconds").record(wait.as_secs_f64());
            }
            QueueEvent::QueueRemoved { wait, priority, .. } => {
                metrics::histogram!(priority_delay_metric(priority)).record(wait.as_secs_f64());
            }
            QueueEvent::Retried { .. } => {
                metrics::counter!("grader_runs_retry").increment(1);
            }
            QueueEvent::Abandoned { .. } => {
                metrics::counter!("grader_runs_abandoned").increment(1);
            }
        }
    }
}

fn priority_delay_metric(priority: Priority) -> &'static str {
    match priority {
        Priority::Ephemeral => "grader_queue_ephemeral_delay_seconds",
        Priority::Low => "grader_queue_low_delay_seconds",
        Priority::Normal => "grader_queue_normal_delay_seconds",
        Priority::High => "grader_queue_high_delay_seconds",
    }
}
