use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::coordination::Role;
use crate::master::Master;
use crate::servant::{ServantPool, WorkerInfo};
use crate::tickets::{TicketQueue, TicketType};

#[derive(Clone)]
pub struct DashboardState {
    pub address: String,
    pub queue: Arc<TicketQueue>,
    pub pool: Arc<ServantPool>,
    pub master: Arc<Master>,
}

#[derive(Serialize)]
struct StatusResponse {
    address: String,
    role: Role,
    active_workers: usize,
    max_workers: usize,
    workers: Vec<WorkerInfo>,
    ticket_count: usize,
    revision: u64,
}

#[derive(Serialize)]
struct TicketResponse {
    id: String,
    #[serde(rename = "type")]
    kind: TicketType,
    revision: u64,
    content_length: usize,
}

#[derive(Serialize)]
struct RescheduleResponse {
    requested: bool,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/tickets", get(tickets_handler))
        .route("/api/dispatch", get(dispatch_handler))
        .route("/api/reschedule", post(reschedule_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let workers = state.pool.workers().await;
    let active_workers = state.pool.servant_count().await;

    Json(StatusResponse {
        address: state.address.clone(),
        role: state.master.role(),
        active_workers,
        max_workers: state.pool.max_workers(),
        workers,
        ticket_count: state.queue.get().len(),
        revision: state.queue.min_revision(),
    })
}

async fn tickets_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let tickets: Vec<TicketResponse> = state
        .queue
        .get()
        .iter()
        .map(|t| TicketResponse {
            id: t.id.clone(),
            kind: t.kind,
            revision: t.revision(),
            content_length: t.content.len(),
        })
        .collect();

    Json(tickets)
}

async fn dispatch_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.master.last_report().map(|report| report.as_ref().clone()))
}

async fn reschedule_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    state.pool.request_master_reschedule();
    (StatusCode::ACCEPTED, Json(RescheduleResponse { requested: true }))
}
