use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Json, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{HubError, Result};
use crate::services::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub token: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct PeersResponse {
    peers: Vec<String>,
}

#[derive(Deserialize)]
struct BroadcastRequest {
    #[serde(default)]
    content: Value,
}

#[derive(Serialize)]
struct BroadcastResponse {
    delivered: usize,
}

#[derive(Deserialize)]
struct UpgradeQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/broadcast", post(broadcast))
        .route(ws_path, get(upgrade))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn peers(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, None, &state.token) {
        return err.into_response();
    }
    let mut peers: Vec<String> = state
        .hub
        .list()
        .iter()
        .filter_map(|peer| peer.identity())
        .collect();
    peers.sort();
    Json(PeersResponse { peers }).into_response()
}

async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BroadcastRequest>,
) -> impl IntoResponse {
    if let Err(err) = authorize(&headers, None, &state.token) {
        return err.into_response();
    }
    let delivered = state.hub.broadcast(payload.content);
    Json(BroadcastResponse { delivered }).into_response()
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UpgradeQuery>,
) -> Response {
    if let Err(err) = authorize(&headers, query.token.as_deref(), &state.token) {
        tracing::warn!("rejected websocket upgrade with bad credentials");
        return err.into_response();
    }
    state.hub.upgrade(ws, json!({ "authorized": true }))
}

/// Accepts a bearer token, an `x-api-key` header or a `?token=` query. An empty
/// configured token accepts every request.
fn authorize(
    headers: &HeaderMap,
    query_token: Option<&str>,
    token: &str,
) -> std::result::Result<(), (StatusCode, Json<ErrorResponse>)> {
    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let bearer = header.strip_prefix("Bearer ").unwrap_or("");

    if bearer == token || api_key == token || query_token == Some(token) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
            }),
        ))
    }
}

pub async fn run(config: Config) -> Result<()> {
    run_with_shutdown(config, futures::future::pending::<()>()).await
}

pub async fn run_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let settings = config.connection_settings()?;
    let hub = Hub::new(settings);
    let state = AppState {
        hub: hub.clone(),
        token: config.token(),
    };
    let ws_path = config.ws_path();
    let app = build_router(state, &ws_path);

    let addr = format!("{}:{}", config.host(), config.port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| HubError::Runtime(e.to_string()))?;
    tracing::info!(%addr, path = %ws_path, "hub listening");
    if config.token().is_empty() {
        tracing::warn!("no token configured, authentication is disabled");
    }
    let shutdown = async move {
        shutdown.await;
        tracing::info!(peers = hub.len(), "shutting down hub");
        hub.shutdown();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HubError::Runtime(e.to_string()))?;

    Ok(())
}
