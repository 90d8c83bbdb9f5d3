use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dilemma_core::SimError;
use dilemma_server::protocol::{
    ApiError, ClientCommand, CreateSessionRequest, CreateSessionResponse, RiskRequest,
    SessionMetadata, SimEvent, SpeedRequest, StepResponse,
};
use dilemma_server::{load_config, Scheduler};
use dilemma_types::{RunSnapshot, SimulationConfig};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
    defaults: SimulationConfig,
}

struct Session {
    id: Uuid,
    scheduler: Scheduler,
}

impl Session {
    async fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            id: self.id,
            config: self.scheduler.config().await,
            running: self.scheduler.is_running().await,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct RunResponse {
    started: bool,
    metadata: SessionMetadata,
}

#[derive(Debug)]
enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::NotFound(message)
            | AppError::BadRequest(message)
            | AppError::Conflict(message)
            | AppError::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };

        let error = ApiError {
            code: code.to_owned(),
            message,
        };

        (status, Json(error)).into_response()
    }
}

impl From<SimError> for AppError {
    fn from(value: SimError) -> Self {
        match value {
            SimError::InvalidConfig(_) => AppError::BadRequest(value.to_string()),
            SimError::RiskLocked | SimError::RunFinished(_) => {
                AppError::Conflict(value.to_string())
            }
            SimError::Invariant(_) => AppError::Internal(value.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "dilemma_server=info,dilemma_core=info,axum=info,tower_http=info".to_owned()
        }))
        .init();

    let config_path = std::env::var_os("DILEMMA_CONFIG").map(PathBuf::from);
    let defaults = load_config(config_path.as_deref())?;
    let app = build_app(AppState {
        sessions: Arc::new(RwLock::new(HashMap::new())),
        defaults,
    });

    let addr =
        std::env::var("DILEMMA_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("dilemma-server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session_metadata))
        .route("/v1/sessions/{id}/state", get(get_state))
        .route("/v1/sessions/{id}/step", post(step_session))
        .route("/v1/sessions/{id}/run", post(run_session))
        .route("/v1/sessions/{id}/pause", post(pause_session))
        .route("/v1/sessions/{id}/restart", post(restart_session))
        .route("/v1/sessions/{id}/speed", post(set_speed))
        .route("/v1/sessions/{id}/risk", post(set_risk))
        .route("/v1/sessions/{id}/stream", get(stream_session))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, AppError> {
    let config = req.apply(state.defaults.clone());
    let scheduler = Scheduler::from_config(config)?;
    let id = Uuid::new_v4();
    let session = Arc::new(Session { id, scheduler });

    let metadata = session.metadata().await;
    let snapshot = session.scheduler.snapshot().await;
    state.sessions.write().await.insert(id, session);
    info!(%id, population = metadata.config.population, "session created");

    Ok(Json(CreateSessionResponse { metadata, snapshot }))
}

async fn get_session_metadata(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<SessionMetadata>, AppError> {
    let session = get_session(&state, id).await?;
    Ok(Json(session.metadata().await))
}

async fn get_state(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunSnapshot>, AppError> {
    let session = get_session(&state, id).await?;
    Ok(Json(session.scheduler.snapshot().await))
}

async fn step_session(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<StepResponse>, AppError> {
    let session = get_session(&state, id).await?;
    let request = session.scheduler.step().await?;
    let snapshot = session.scheduler.snapshot().await;
    Ok(Json(StepResponse { request, snapshot }))
}

async fn run_session(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunResponse>, AppError> {
    let session = get_session(&state, id).await?;
    let started = session.scheduler.run().await;
    Ok(Json(RunResponse {
        started,
        metadata: session.metadata().await,
    }))
}

async fn pause_session(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<SessionMetadata>, AppError> {
    let session = get_session(&state, id).await?;
    session.scheduler.pause().await;
    Ok(Json(session.metadata().await))
}

async fn restart_session(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<RunSnapshot>, AppError> {
    let session = get_session(&state, id).await?;
    Ok(Json(session.scheduler.restart().await?))
}

async fn set_speed(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<SpeedRequest>,
) -> Result<Json<SessionMetadata>, AppError> {
    let session = get_session(&state, id).await?;
    session.scheduler.set_speed(req.speed).await?;
    Ok(Json(session.metadata().await))
}

async fn set_risk(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(req): Json<RiskRequest>,
) -> Result<Json<SessionMetadata>, AppError> {
    let session = get_session(&state, id).await?;
    session
        .scheduler
        .set_risk_probability(req.risk_probability)
        .await?;
    Ok(Json(session.metadata().await))
}

async fn stream_session(
    ws: WebSocketUpgrade,
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let session = get_session(&state, id).await?;
    Ok(ws
        .on_upgrade(move |socket| socket_loop(socket, session))
        .into_response())
}

async fn socket_loop(socket: WebSocket, session: Arc<Session>) {
    let mut rx = session.scheduler.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let initial = SimEvent::StateSnapshot(session.scheduler.snapshot().await);
    if send_ws_event(&mut sender, &initial).await.is_err() {
        return;
    }

    let scheduler = session.scheduler.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("ws receiver lagged by {skipped} events; sending state snapshot");
                    SimEvent::StateSnapshot(scheduler.snapshot().await)
                }
                Err(RecvError::Closed) => break,
            };

            if send_ws_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let command = match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        let message = format!("failed to parse command: {err}");
                        report_error(&session, "bad_command", message);
                        continue;
                    }
                };

                if let Err(err) = session.scheduler.apply(command).await {
                    report_error(&session, "command_error", err.to_string());
                }
            }
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(err) => {
                error!("ws receive error: {err}");
                break;
            }
        }
    }

    send_task.abort();
}

fn report_error(session: &Session, code: &str, message: String) {
    session.scheduler.publish(SimEvent::Error(ApiError {
        code: code.to_owned(),
        message,
    }));
}

async fn send_ws_event(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &SimEvent,
) -> Result<(), ()> {
    match serde_json::to_string(event) {
        Ok(text) => sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ()),
        Err(err) => {
            error!("failed to serialize sim event: {err}");
            Ok(())
        }
    }
}

async fn get_session(state: &AppState, id: Uuid) -> Result<Arc<Session>, AppError> {
    let sessions = state.sessions.read().await;
    sessions
        .get(&id)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
}
