//! HTTP API: pairing, introspection, and the realtime event stream.
//!
//! Spawned as a background task from `Server::run`, same pattern as
//! the snapshot tick.

use crate::server::Server;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use courier_core::config::ApiConfig;
use courier_core::error::CourierError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    server: Arc<Server>,
}

impl ApiState {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[derive(Debug, Deserialize)]
struct PairRequest {
    number: Option<String>,
}

fn bad_request(error: &str, details: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": error, "details": details})),
    )
}

fn internal(error: &str, e: CourierError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": error, "details": e.to_string()})),
    )
}

/// `POST /pair` with `{number}`. Issues a pairing code for a new
/// number, or reports the existing session.
async fn pair(
    State(state): State<ApiState>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Json(request) = body.map_err(|e| bad_request("invalid request", e.to_string()))?;

    let number: String = request
        .number
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    if number.is_empty() {
        return Err(bad_request(
            "number is required",
            "provide a phone number in international format".to_string(),
        ));
    }

    let outcome = state.server.pair(&number).await.map_err(|e| {
        error!("pairing failed for {number}: {e}");
        internal("pairing failed", e)
    })?;

    let message = if outcome.reused {
        "Session already active"
    } else if outcome.pairing_code.is_some() {
        "Enter the pairing code under Linked Devices"
    } else {
        "Reconnected from stored credentials"
    };

    Ok(Json(json!({
        "success": true,
        "pairingCode": outcome.pairing_code.unwrap_or_default(),
        "message": message,
        "isNewUser": outcome.new_user,
    })))
}

/// `GET /commands` lists every registered pattern.
async fn commands(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({"commands": state.server.context().registry.patterns()}))
}

/// `GET /store-stats` reports connection and session aggregates.
async fn store_stats(
    State(state): State<ApiState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let ctx = state.server.context();
    let stored = ctx
        .store
        .count_sessions()
        .await
        .map_err(|e| internal("store query failed", e))?;
    let active_sessions = ctx
        .store
        .count_active_sessions()
        .await
        .map_err(|e| internal("store query failed", e))?;

    Ok(Json(json!({
        "activeConnections": ctx.stats.active_connections(),
        "totalUsers": stored,
        "storedSessions": stored,
        "activeSessions": active_sessions,
    })))
}

/// `GET /events` pushes counter and lifecycle events as SSE.
async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.server.context().stats.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| match event {
        Ok(event) => Some(Ok(SseEvent::default()
            .event(event.name())
            .data(event.payload().to_string()))),
        // A lagged listener just skips to the next event.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/pair", post(pair))
        .route("/commands", get(commands))
        .route("/store-stats", get(store_stats))
        .route("/events", get(events))
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Start the API server. Called from `Server::run`.
pub async fn serve(config: ApiConfig, state: ApiState) {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("API server failed to bind to {addr}: {e}");
            return;
        }
    };

    info!("API server listening on {addr}");

    if let Err(e) = axum::serve(listener, app).await {
        error!("API server error: {e}");
    }
}
