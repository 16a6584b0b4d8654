//! A minimal read-only admin surface: liveness and a fleet snapshot. Strictly
//! observability — no route here mutates a job or a worker.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::scheduler::WorkerHandle;

#[derive(Clone)]
pub struct AdminState {
    pub workers: Arc<Vec<Arc<WorkerHandle>>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

#[derive(Serialize)]
struct WorkerSnapshot {
    store_uri: String,
    system_types: Vec<String>,
    busy: bool,
}

#[derive(Serialize)]
struct MetricsResponse {
    fleet_size: usize,
    busy_count: usize,
    workers: Vec<WorkerSnapshot>,
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    let mut workers = Vec::with_capacity(state.workers.len());
    let mut busy_count = 0;

    for worker in state.workers.iter() {
        let busy = worker.inbox.lock().await.is_some();
        if busy {
            busy_count += 1;
        }
        workers.push(WorkerSnapshot {
            store_uri: worker.machine.store_uri.clone(),
            system_types: worker.machine.system_types.clone(),
            busy,
        });
    }

    Json(MetricsResponse {
        fleet_size: state.workers.len(),
        busy_count,
        workers,
    })
}
