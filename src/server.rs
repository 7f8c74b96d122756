//! HTTP surface of the mock server.
//!
//! Every request outside the reserved `/__mock` prefix is served by the
//! [`ResponsePipeline`]. The prefix carries a small JSON API and a
//! `WebSocket` event stream for dashboards:
//!
//! - `GET /__mock/endpoints` -- live generation
//! - `POST /__mock/reload` -- reload the configuration now
//! - `GET /__mock/stats` -- request counters
//! - `GET /__mock/ws` -- event stream, a `reload` text frame triggers a reload

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::parse_body;
use crate::events::{timestamp, EventBus, MockEvent};
use crate::loader::ConfigReloader;
use crate::pipeline::{MockRequest, MockResponse, ResponsePipeline};

/// Shared state for the axum application.
pub struct AppState {
    pub pipeline: Arc<ResponsePipeline>,
    pub reloader: Arc<ConfigReloader>,
    pub events: EventBus,
}

impl AppState {
    /// Build the state around the reloader's registry.
    pub fn new(reloader: Arc<ConfigReloader>, events: EventBus) -> Self {
        let pipeline = ResponsePipeline::new(Arc::clone(reloader.registry()), events.clone());
        Self {
            pipeline: Arc::new(pipeline),
            reloader,
            events,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 3000,
        }
    }
}

/// Errors starting or running the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(String),

    #[error("serve error: {0}")]
    Serve(String),
}

/// Build the router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/__mock/endpoints", get(list_endpoints))
        .route("/__mock/reload", post(reload))
        .route("/__mock/stats", get(stats))
        .route("/__mock/ws", get(ws_events))
        .fallback(serve_mock)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn start_server(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))?;

    let events = state.events.clone();
    let router = build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(format!("bind failed on {addr}: {e}")))?;

    events.info(format!("Mock API server running on http://{addr}"));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ServerError::Serve(format!("serve error: {e}")))?;

    info!("Mock API server stopped");
    Ok(())
}

/// Fallback handler: every non-reserved request goes through the pipeline.
async fn serve_mock(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let request = MockRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        body: parse_body(&body),
    };

    into_http(state.pipeline.handle(request).await)
}

fn into_http(response: MockResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        warn!(status = response.status, "Configured status code is not valid HTTP");
        StatusCode::INTERNAL_SERVER_ERROR
    });
    (status, Json(response.body)).into_response()
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let generation = state.reloader.registry().current();
    Json(json!({
        "version": generation.version(),
        "endpoints": generation.endpoints(),
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let generation = state.reloader.registry().current();
    Json(json!({
        "version": generation.version(),
        "endpoints": generation.len(),
        "requests": state.pipeline.stats(),
    }))
}

async fn reload(State(state): State<Arc<AppState>>) -> Response {
    state.events.info("Manual reload requested");

    match state.reloader.reload().await {
        Ok(generation) => {
            state.events.info("Configuration reloaded");
            Json(json!({
                "reloaded": true,
                "version": generation.version(),
                "endpoints": generation.len(),
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Reload failed",
                "message": e.to_string(),
                "timestamp": timestamp(),
            })),
        )
            .into_response(),
    }
}

async fn ws_events(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

/// Forward events to one dashboard client and accept reload requests.
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.events.subscribe();
    state.events.info("Dashboard connected");

    let generation = state.reloader.registry().current();
    let snapshot = MockEvent::EndpointUpdate {
        version: generation.version(),
        endpoints: generation.endpoints(),
    };
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            debug!("WebSocket client disconnected (send failed)");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "WebSocket client lagged, skipping ahead");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text.as_str().trim() == "reload" => {
                        state.events.info("Manual reload requested");
                        if state.reloader.reload().await.is_ok() {
                            state.events.info("Configuration reloaded");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.events.info("Dashboard disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &MockEvent) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize event: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(json.into())).await
}
