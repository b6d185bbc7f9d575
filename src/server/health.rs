//! Health endpoints
//!
//! - `/health`: liveness plus the current bootstrap stage
//! - `/status`: stage, organization, shutdown phase and consumer counters
//!
//! The server stays up through the drain so health checks see `stopping`.

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use orgflow_core::{
    BootstrapMachine, BootstrapStage, ConsumerStats, ShutdownController, ShutdownPhase,
    StatsSnapshot,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// What the handlers read from.
#[derive(Clone)]
pub struct HealthState {
    pub organization: String,
    pub machine: Arc<BootstrapMachine>,
    pub stats: Arc<ConsumerStats>,
    pub shutdown: Arc<ShutdownController>,
}

/// Liveness response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub stage: Option<BootstrapStage>,
}

/// Detailed status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub organization: String,
    pub stage: Option<BootstrapStage>,
    pub orchestrating: bool,
    pub shutdown: String,
    pub consumer: StatsSnapshot,
}

fn status_label(phase: ShutdownPhase, stage: Option<BootstrapStage>) -> &'static str {
    if phase != ShutdownPhase::Running {
        return "stopping";
    }
    match stage {
        None => "starting",
        Some(stage) if stage.is_active_orchestrator() => "healthy",
        Some(_) => "passive",
    }
}

async fn health_check(Extension(state): Extension<HealthState>) -> Json<HealthResponse> {
    let stage = state.machine.current_stage();
    Json(HealthResponse {
        status: status_label(state.shutdown.phase(), stage),
        version: env!("CARGO_PKG_VERSION"),
        stage,
    })
}

async fn status(Extension(state): Extension<HealthState>) -> Json<StatusResponse> {
    let stage = state.machine.current_stage();
    Json(StatusResponse {
        organization: state.organization.clone(),
        stage,
        orchestrating: stage.is_some_and(|s| s.is_active_orchestrator()),
        shutdown: state.shutdown.phase().to_string(),
        consumer: state.stats.snapshot(),
    })
}

/// Create health routes
pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

/// Serve the health routes until `token` fires.
pub async fn serve(bind: SocketAddr, state: HealthState, token: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind health endpoint to {bind}"))?;
    info!("Health endpoint listening on http://{}", bind);

    axum::serve(listener, health_routes(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Health server error")
}
