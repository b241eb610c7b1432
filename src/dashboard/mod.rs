use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::collision::JobStealingResolver;
use crate::node::{NodeStats, NodeStatsSnapshot};
use crate::scheduler::JobQueue;
use crate::topology::NodeId;

#[derive(Clone)]
pub struct DashboardState {
    pub node_id: NodeId,
    pub balancer: &'static str,
    pub job_queue: Arc<RwLock<JobQueue>>,
    pub resolver: Arc<JobStealingResolver>,
    pub stats: Arc<NodeStats>,
}

#[derive(Serialize)]
struct NodeStatusResponse {
    node_id: String,
    balancer: &'static str,
    waiting_jobs: usize,
    active_jobs: usize,
    #[serde(flatten)]
    stats: NodeStatsSnapshot,
}

/// Read-only status routes.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/node", get(node_status_handler))
        .route("/api/stealing", get(stealing_handler))
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
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn node_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let (waiting_jobs, active_jobs) = {
        let queue = state.job_queue.read().await;
        (queue.waiting_len(), queue.active_len())
    };

    Json(NodeStatusResponse {
        node_id: state.node_id.to_string(),
        balancer: state.balancer,
        waiting_jobs,
        active_jobs,
        stats: state.stats.snapshot(),
    })
}

async fn stealing_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.resolver.metrics())
}
