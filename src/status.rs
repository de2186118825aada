use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::{CacheStats, InputCache};
use crate::monitor::InflightMonitor;
use crate::queue::run::Priority;
use crate::queue::{EventHub, RunQueue};

/// Shared read-only view handed to the status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub queue: Arc<RunQueue>,
    pub monitor: Arc<InflightMonitor>,
    pub cache: Arc<InputCache>,
    pub events: Arc<EventHub>,
}

#[derive(Serialize)]
struct QueueDepthResponse {
    total: usize,
    high: usize,
    normal: usize,
    low: usize,
    ephemeral: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    queue: QueueDepthResponse,
    inflight: usize,
    cache: CacheStats,
    events_dropped: u64,
}

fn queue_depths(queue: &RunQueue) -> QueueDepthResponse {
    QueueDepthResponse {
        total: queue.len(),
        high: queue.len_by_priority(Priority::High),
        normal: queue.len_by_priority(Priority::Normal),
        low: queue.len_by_priority(Priority::Low),
        ephemeral: queue.len_by_priority(Priority::Ephemeral),
    }
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(StatusResponse {
        queue: queue_depths(&state.queue),
        inflight: state.monitor.len(),
        cache: state.cache.stats(),
        events_dropped: state.events.dropped(),
    })
}

async fn queue_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(queue_depths(&state.queue))
}

async fn inflight_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.monitor.snapshot())
}

async fn cache_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.cache.stats())
}

/// Serve the read-only status endpoint.
pub async fn run_status_server(addr: SocketAddr, state: StatusState) {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/status/queue", get(queue_handler))
        .route("/status/inflight", get(inflight_handler))
        .route("/status/cache", get(cache_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Status server failed");
    }
}
