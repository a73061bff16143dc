//! HTTP and WebSocket routes.

use std::{sync::Arc, time::Duration};

use actionstream_core::{
    AcceptedResponse, ActionId, ErrorResponse, InterpreterCellBody, SandboxId, ShellCommandBody,
};
use actionstream_executor::ExecutionService;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{sync::broadcast, time::Instant};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::hub::EventHub;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExecutionService>,
    pub hub: EventHub,
    pub ping_interval: Duration,
}

/// All routes with tracing and permissive CORS.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/sandboxes/{sandbox_id}/shell", post(submit_shell))
        .route("/v1/sandboxes/{sandbox_id}/ipython", post(submit_cell))
        .route("/v1/sandboxes/{sandbox_id}/stream", get(stream))
        .route("/v1/internal/observations/{sandbox_id}", post(ingest))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// A 4xx with an [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn bad_request(message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                message: message.into(),
                detail,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!("Invalid request body: {e}");
        ApiError::bad_request("invalid request body", Some(e.to_string()))
    })
}

fn accepted(action_id: ActionId) -> (StatusCode, Json<AcceptedResponse>) {
    (StatusCode::ACCEPTED, Json(AcceptedResponse { action_id }))
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_shell(
    State(state): State<AppState>,
    Path(sandbox_id): Path<SandboxId>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let body: ShellCommandBody = parse_body(&body)?;
    if body.command.trim().is_empty() {
        return Err(ApiError::bad_request("command must not be empty", None));
    }

    let action_id = ActionId::generate();
    tracing::info!(%sandbox_id, %action_id, command = %body.command, "Accepted shell command");
    let service = Arc::clone(&state.service);
    let id = action_id.clone();
    tokio::spawn(async move {
        service.run_shell(&sandbox_id, &id, body).await;
    });
    Ok(accepted(action_id))
}

async fn submit_cell(
    State(state): State<AppState>,
    Path(sandbox_id): Path<SandboxId>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let body: InterpreterCellBody = parse_body(&body)?;
    if body.code.trim().is_empty() {
        return Err(ApiError::bad_request("code must not be empty", None));
    }

    let action_id = ActionId::generate();
    tracing::info!(%sandbox_id, %action_id, "Accepted interpreter cell");
    let service = Arc::clone(&state.service);
    let id = action_id.clone();
    tokio::spawn(async move {
        service.run_cell(&sandbox_id, &id, body).await;
    });
    Ok(accepted(action_id))
}

/// Relay an externally produced observation to the sandbox's subscribers.
///
/// The body is forwarded as-is; subscribers normalize it.
async fn ingest(
    State(state): State<AppState>,
    Path(sandbox_id): Path<SandboxId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let value: Value = parse_body(&body)?;
    if !value.is_object() {
        return Err(ApiError::bad_request("observation must be a JSON object", None));
    }
    let frame = String::from_utf8_lossy(&body).into_owned();
    let reached = state.hub.publish(&sandbox_id, frame);
    tracing::debug!(%sandbox_id, reached, "Ingested observation");
    Ok(StatusCode::OK)
}

async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(sandbox_id): Path<SandboxId>,
) -> impl IntoResponse {
    // subscribe now so nothing published after the handshake is missed
    let events = state.hub.subscribe(&sandbox_id);
    let ping_interval = state.ping_interval;
    ws.on_upgrade(move |socket| forward_events(socket, sandbox_id, events, ping_interval))
}

async fn forward_events(
    socket: WebSocket,
    sandbox_id: SandboxId,
    mut events: broadcast::Receiver<Arc<str>>,
    ping_interval: Duration,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    tracing::info!(%sandbox_id, "Stream subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(frame) => {
                    if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%sandbox_id, skipped, "Stream subscriber lagging; events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(%sandbox_id, "WebSocket error: {e}");
                    break;
                }
            },
        }
    }

    tracing::info!(%sandbox_id, "Stream subscriber disconnected");
}
