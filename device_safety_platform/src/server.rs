//! HTTP server exposing query submission, run inspection and the live event
//! stream.

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{AggregationError, RunError},
    middleware::{create_body_limit_layer, create_cors_layer, request_logging_middleware},
    registry::AgentDescriptor,
    runs::RunManager,
    settings::Settings,
    websocket::forward_events,
};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunManager>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(runs: Arc<RunManager>) -> Self {
        Self {
            runs,
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    agent_count: usize,
    active_runs: usize,
}

#[derive(Deserialize)]
struct SubmitQueryRequest {
    query: String,
}

#[derive(Serialize)]
struct SubmitQueryResponse {
    run_id: Uuid,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error wrapper mapping run errors onto HTTP status codes
pub struct ApiError(RunError);

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RunError::Classification(_) => StatusCode::BAD_REQUEST,
            RunError::NotFound(_) => StatusCode::NOT_FOUND,
            RunError::AlreadySubscribed(_) => StatusCode::CONFLICT,
            RunError::Aggregation(AggregationError::IncompleteRun(_)) => StatusCode::CONFLICT,
            RunError::Plan(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the HTTP router with all endpoints and middleware
pub fn create_router(state: AppState, settings: &Settings) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/agents", get(list_agents))
        .route("/queries", post(submit_query))
        .route("/runs/:id", get(run_snapshot).delete(cancel_run))
        .route("/runs/:id/result", get(run_result))
        .route("/runs/:id/events", get(run_events))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer(&settings.server))
        .layer(create_body_limit_layer(settings.server.max_request_size_kb))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        agent_count: state.runs.registry().list().len(),
        active_runs: state.runs.len(),
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentDescriptor>> {
    Json(state.runs.registry().list().to_vec())
}

#[instrument(skip(state, request))]
async fn submit_query(
    State(state): State<AppState>,
    Json(request): Json<SubmitQueryRequest>,
) -> Result<(StatusCode, Json<SubmitQueryResponse>), ApiError> {
    let run_id = state.runs.submit(&request.query)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitQueryResponse { run_id })))
}

async fn run_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.snapshot(run_id).await?))
}

async fn run_result(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.result(run_id).await?))
}

#[instrument(skip(state))]
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.runs.cancel(run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let events = state.runs.subscribe(run_id)?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, run_id, events)))
}

/// Start the HTTP server and wait for shutdown signal
pub async fn serve(settings: &Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port)
            .parse()
            .context("Invalid server address")?,
    };

    let runs = RunManager::from_settings(settings)?;
    let shutdown = CancellationToken::new();
    let sweeper = runs.spawn_retention_sweeper(
        Duration::from_secs(settings.orchestrator.sweep_interval_seconds.max(1)),
        shutdown.clone(),
    );

    let app = create_router(AppState::new(runs), settings);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "HTTP server listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await;

    shutdown.cancel();
    let _ = sweeper.await;
    if let Err(e) = &result {
        error!(error = %e, "HTTP server error");
    }
    info!("HTTP server shutdown complete");
    result.context("HTTP server failed")
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
