//! WebSocket gateway that bridges terminal clients to container exec and
//! attach sessions.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod handshake;
pub mod heartbeat;
pub mod pipe;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod telemetry;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    auth::Authorizer,
    bridge::{BridgeConfig, SessionTarget},
    handshake::{record_handshake_failure, resolve_container, EntryQuery, EntryRequest, HandshakeError},
    registry::{SessionMode, SessionRegistry, SessionSnapshot},
    relay::{ClientWriter, FrameSink, FrameStream},
    runtime::ContainerRuntime,
};

pub struct AppState {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub authorizer: Authorizer,
    pub handshake_timeout: Duration,
    pub bridge: BridgeConfig,
    pub registry: SessionRegistry,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    sessions: Vec<SessionSnapshot>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/enter", get(enter_handler))
        .route("/attach", get(attach_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.registry.snapshot();
    Json(StatsResponse {
        active_sessions: sessions.len(),
        sessions,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn enter_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EntryQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request = EntryRequest::from_parts(&query, &headers);
    ws.on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_connection(socket, state, request, SessionMode::Enter))
}

async fn attach_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EntryQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request = EntryRequest::from_parts(&query, &headers);
    ws.on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_connection(socket, state, request, SessionMode::Attach))
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    request: EntryRequest,
    mode: SessionMode,
) {
    let (ws_tx, ws_rx) = socket.split();
    let sink: FrameSink = Box::pin(ws_tx);
    let mut frames: FrameStream = Box::pin(ws_rx);

    let container_id = match authenticate(&state, &request, &mut frames).await {
        Ok(container_id) => container_id,
        Err(err) => {
            record_handshake_failure(&err);
            warn!(mode = mode.label(), method = request.mode_label(), error = %err, "handshake failed");
            return;
        }
    };

    let guard = state.registry.register(&container_id, mode);
    let target = SessionTarget {
        session_id: guard.session_id(),
        container_id,
    };
    counter!("entry_sessions_total", 1, "mode" => mode.label());
    info!(
        session_id = %target.session_id,
        container_id = %target.container_id,
        mode = mode.label(),
        codec = request.codec.label(),
        "session started"
    );

    let writer = ClientWriter::new(sink, request.codec);
    let runtime = Arc::clone(&state.runtime);
    match mode {
        SessionMode::Enter => {
            bridge::enter(runtime, writer, frames, &target, &request.term_type, &state.bridge).await
        }
        SessionMode::Attach => bridge::attach(runtime, writer, frames, &target, &state.bridge).await,
    }
    drop(guard);
}

async fn authenticate(
    state: &AppState,
    request: &EntryRequest,
    frames: &mut FrameStream,
) -> Result<String, HandshakeError> {
    let container_id = resolve_container(request, frames, state.handshake_timeout).await?;
    state
        .authorizer
        .authorize(request.access_token.as_deref(), &container_id)
        .await?;
    Ok(container_id)
}
