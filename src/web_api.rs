//! Web API Server
//!
//! HTTP REST API and WebSocket event stream for the simulation queue.
//!
//! ## Endpoints
//!
//! ### Negotiations
//! - `POST /api/negotiations` — Create a negotiation
//! - `GET  /api/negotiations/:id` — Negotiation with its queues
//! - `POST /api/negotiations/:id/start` — Create or resume its queue
//!
//! ### Queues and runs
//! - `GET  /api/simulations/queue/:id/status` — Progress and cost
//! - `GET  /api/simulations/queue/:id/results` — Runs with technique/tactic
//! - `POST /api/simulations/queue/:id/{pause,resume,stop,restart-failed}`
//! - `GET  /api/simulations/run/:id` — One run
//! - `POST /api/simulations/run/:id/restart` — Restart one run
//!
//! ### Catalog and service
//! - `GET  /api/techniques`, `GET /api/tactics` — Catalog
//! - `GET  /api/costs` — Service-wide cost totals
//! - `GET  /health` — Health check
//! - `GET  /metrics` — Prometheus metrics
//!
//! ### WebSocket
//! - `WS /ws` — Every simulation event as `{type, negotiationId, data}`

use axum::{
    body::Body,
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::simulation::catalog::{Tactic, Technique};
use crate::simulation::model::{
    Negotiation, QueueProgress, Scenario, SimulationQueue, SimulationRun,
};
use crate::simulation::queue::{RestartReport, RunResult};
use crate::simulation::SimulationError;
use crate::QueueOrchestrator;

// ============================================================================
// Types
// ============================================================================

/// JSON body for `POST /api/negotiations`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNegotiationRequest {
    /// Display title.
    pub title: String,
    /// Scenario, including the selected technique and tactic IDs.
    pub scenario: Scenario,
}

/// Response of `GET /api/negotiations/:id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    /// The negotiation.
    #[serde(flatten)]
    pub negotiation: Negotiation,
    /// Its queues, oldest first.
    pub queues: Vec<SimulationQueue>,
}

/// Response of `GET /api/simulations/queue/:id/results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResultsResponse {
    /// Progress snapshot.
    pub queue: QueueProgress,
    /// Runs in `run_number` order.
    pub runs: Vec<RunResult>,
}

/// Shared application state available to all handlers.
struct AppState {
    orchestrator: Arc<QueueOrchestrator>,
}

// ============================================================================
// Constants
// ============================================================================

/// Maximum WebSocket message size (1 MB).
const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket ping interval in seconds.
const WS_PING_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Server
// ============================================================================

/// Build the application router.
///
/// Exposed separately from [`start_server`] so tests can serve it on an
/// ephemeral listener.
///
/// # Panics
///
/// This function never panics.
pub fn router(orchestrator: Arc<QueueOrchestrator>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState { orchestrator });

    Router::new()
        .route("/api/negotiations", post(create_negotiation_handler))
        .route("/api/negotiations/:id", get(get_negotiation_handler))
        .route("/api/negotiations/:id/start", post(start_handler))
        .route("/api/simulations/queue/:id/status", get(queue_status_handler))
        .route("/api/simulations/queue/:id/results", get(queue_results_handler))
        .route("/api/simulations/queue/:id/pause", post(pause_handler))
        .route("/api/simulations/queue/:id/resume", post(resume_handler))
        .route("/api/simulations/queue/:id/stop", post(stop_handler))
        .route(
            "/api/simulations/queue/:id/restart-failed",
            post(restart_failed_handler),
        )
        .route("/api/simulations/run/:id", get(get_run_handler))
        .route("/api/simulations/run/:id/restart", post(restart_run_handler))
        .route("/api/techniques", get(techniques_handler))
        .route("/api/tactics", get(tactics_handler))
        .route("/api/costs", get(costs_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            config.max_request_size,
            body_size_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the web API server.
///
/// Binds to `config.host:config.port` and serves the REST API and the
/// WebSocket endpoint. Blocks until the server shuts down.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    config: ServerConfig,
    orchestrator: Arc<QueueOrchestrator>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);

    info!("Starting web API server on http://{}", addr);

    let app = router(orchestrator, &config);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Web API ready on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds a unique `X-Request-ID` header to every response.
///
/// If the client sends an `X-Request-ID` header, it is preserved; otherwise
/// a new UUID v4 is generated.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "Request body too large"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// Negotiation Handlers
// ============================================================================

/// `POST /api/negotiations` — Create a negotiation.
async fn create_negotiation_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateNegotiationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Negotiation>), AppError> {
    let Json(req) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let negotiation = state
        .orchestrator
        .create_negotiation(&req.title, req.scenario)
        .await?;
    Ok((StatusCode::CREATED, Json(negotiation)))
}

/// `GET /api/negotiations/:id` — Negotiation with its queues.
async fn get_negotiation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NegotiationResponse>, AppError> {
    let negotiation = state.orchestrator.get_negotiation(&id).await?;
    let queues = state.orchestrator.queues_for_negotiation(&id).await?;
    Ok(Json(NegotiationResponse {
        negotiation,
        queues,
    }))
}

/// `POST /api/negotiations/:id/start` — Create or resume the queue.
async fn start_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimulationQueue>, AppError> {
    Ok(Json(state.orchestrator.start_negotiation(&id).await?))
}

// ============================================================================
// Queue Handlers
// ============================================================================

/// `GET /api/simulations/queue/:id/status`
async fn queue_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QueueProgress>, AppError> {
    Ok(Json(state.orchestrator.queue_status(&id).await?))
}

/// `GET /api/simulations/queue/:id/results`
async fn queue_results_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QueueResultsResponse>, AppError> {
    let queue = state.orchestrator.queue_status(&id).await?;
    let runs = state.orchestrator.queue_results(&id).await?;
    Ok(Json(QueueResultsResponse { queue, runs }))
}

/// `POST /api/simulations/queue/:id/pause`
async fn pause_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimulationQueue>, AppError> {
    Ok(Json(state.orchestrator.pause(&id).await?))
}

/// `POST /api/simulations/queue/:id/resume`
async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimulationQueue>, AppError> {
    Ok(Json(state.orchestrator.resume(&id).await?))
}

/// `POST /api/simulations/queue/:id/stop`
async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimulationQueue>, AppError> {
    Ok(Json(state.orchestrator.stop(&id).await?))
}

/// `POST /api/simulations/queue/:id/restart-failed`
async fn restart_failed_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RestartReport>, AppError> {
    Ok(Json(state.orchestrator.restart_failed(&id).await?))
}

// ============================================================================
// Run Handlers
// ============================================================================

/// `GET /api/simulations/run/:id`
async fn get_run_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimulationRun>, AppError> {
    Ok(Json(state.orchestrator.get_run(&id).await?))
}

/// `POST /api/simulations/run/:id/restart`
async fn restart_run_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SimulationRun>, AppError> {
    Ok(Json(state.orchestrator.restart_single(&id).await?))
}

// ============================================================================
// Catalog Handlers
// ============================================================================

/// `GET /api/techniques`
async fn techniques_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Technique>> {
    Json(state.orchestrator.catalog().techniques.clone())
}

/// `GET /api/tactics`
async fn tactics_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Tactic>> {
    Json(state.orchestrator.catalog().tactics.clone())
}

// ============================================================================
// WebSocket
// ============================================================================

/// `GET /ws` — WebSocket upgrade handler.
///
/// Upgrades the connection to a WebSocket with a 1 MB message size limit.
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(|socket| websocket_stream(socket, state))
}

/// Forward every simulation event to the client until it disconnects.
///
/// Client messages are ignored apart from close and ping. A client that
/// lags the broadcast buffer skips the missed events.
async fn websocket_stream(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = state.orchestrator.notifier().subscribe();
    info!(
        subscribers = state.orchestrator.notifier().subscriber_count(),
        "WebSocket client connected"
    );

    let mut ping_interval = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if socket.send(Message::Text(event.to_json())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                    _ => {} // Text, Binary, Pong — ignore
                }
            }
            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

// ============================================================================
// Utility Handlers
// ============================================================================

/// `GET /health` — Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let dispatcher = state.orchestrator.dispatcher();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "runsInFlight": dispatcher.in_flight(),
        "maxConcurrency": dispatcher.capacity(),
    }))
}

/// `GET /api/costs` — Service-wide cost totals.
async fn costs_handler(State(state): State<Arc<AppState>>) -> Json<crate::cost::CostSnapshot> {
    Json(state.orchestrator.cost_snapshot())
}

/// `GET /metrics` — Prometheus metrics endpoint.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Error Type
// ============================================================================

/// Application-level errors returned by API handlers.
///
/// Each variant maps to an HTTP status code and a JSON error body.
#[derive(Debug)]
enum AppError {
    /// Malformed body or failed validation.
    BadRequest(String),
    /// The requested resource was not found.
    NotFound(String),
    /// The operation is illegal in the current status.
    Conflict(String),
    /// The store failed.
    Internal(String),
}

impl From<SimulationError> for AppError {
    fn from(err: SimulationError) -> Self {
        let message = err.to_string();
        match err {
            SimulationError::Validation(_) => Self::BadRequest(message),
            SimulationError::NegotiationNotFound { .. }
            | SimulationError::QueueNotFound { .. }
            | SimulationError::RunNotFound { .. } => Self::NotFound(message),
            SimulationError::InvalidTransition { .. } => Self::Conflict(message),
            SimulationError::Store(_) => Self::Internal(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m),
            AppError::Internal(m) => {
                error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================
