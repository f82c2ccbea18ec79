//! Connection handlers for the Switchboard server.
//!
//! This module handles the HTTP surface and the lifecycle of each WebSocket:
//! one reader loop feeding the session, one writer task draining the session's
//! outbound queue.

use crate::config::{BackendConfig, BackendKind, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Instant;
use switchboard_backend::RedisOptions;
use switchboard_core::{Backends, Instance, Session};
use switchboard_protocol::UserId;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay instance.
    pub instance: Arc<Instance>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(instance: Arc<Instance>, config: Config) -> Self {
        Self { instance, config }
    }
}

/// Query string of the upgrade endpoint.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// The connecting user.
    pub user: Option<String>,
}

/// Connect the configured backends.
///
/// # Errors
///
/// Returns an error if a networked backend cannot be reached.
pub async fn build_backends(config: &BackendConfig) -> Result<Backends> {
    match config.kind {
        BackendKind::Memory => {
            info!("Using in-memory backends (single instance only)");
            Ok(Backends::memory())
        }
        BackendKind::Redis => {
            let options = RedisOptions {
                url: config.redis_url.clone(),
                bus_channel: config.bus_channel.clone(),
                mailbox_suffix: config.mailbox_suffix.clone(),
            };
            switchboard_backend::connect_redis(&options)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start, or when the outbound relay stops.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let backends = build_backends(&config.backend).await?;
    let instance = Arc::new(Instance::new(backends, config.instance_config()));

    let _stats_sync = config
        .metrics
        .enabled
        .then(|| metrics::spawn_stats_sync(Arc::clone(&instance), metrics::STATS_SYNC_INTERVAL));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Switchboard listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}?user=<id>",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(instance, config))).await
}

/// Start the outbound relay, then accept connections on `listener`.
///
/// Only returns on failure. The relay stopping is a failure: the instance can no
/// longer deliver to its users, so the server stops with it.
///
/// # Errors
///
/// Returns an error if the bus subscription fails, the relay stops, or the
/// server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let relay = state
        .instance
        .start_relay()
        .await
        .context("Failed to subscribe to the message bus")?;

    tokio::select! {
        served = axum::serve(listener, app(state)).into_future() => {
            served.context("HTTP server failed")
        }
        relay = relay => {
            match relay {
                Ok(Ok(())) => anyhow::bail!("Outbound relay stopped"),
                Ok(Err(e)) => Err(e).context("Outbound relay failed"),
                Err(e) => Err(e).context("Outbound relay panicked"),
            }
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .with_state(state)
}

/// Liveness page.
async fn root_handler() -> Html<&'static str> {
    Html("<p>Welcome to Switchboard</p>")
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.instance.registry().len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = match params.user.map(UserId::parse) {
        Some(Ok(user)) => user,
        Some(Err(e)) => {
            debug!(error = %e, "Rejecting upgrade with invalid user");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        None => {
            return (StatusCode::BAD_REQUEST, "missing user query parameter").into_response();
        }
    };

    if state.instance.registry().len() >= state.config.limits.max_connections {
        warn!(user = %user, "Connection limit reached, rejecting upgrade");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user: UserId) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sink, mut receiver) = socket.split();
    let (mut session, outbound) = state.instance.connect(user).await;
    let shutdown = session.handle().shutdown_signal();
    let writer = tokio::spawn(write_outbound(sink, outbound, session.user().clone()));

    loop {
        tokio::select! {
            biased;

            () = shutdown.notified() => {
                debug!(user = %session.user(), "Session displaced by a newer connection");
                break;
            }

            msg = receiver.next() => {
                let raw = match msg {
                    Some(Ok(Message::Text(text))) => Bytes::from(text),
                    Some(Ok(Message::Binary(data))) => Bytes::from(data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(user = %session.user(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(user = %session.user(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(user = %session.user(), "WebSocket stream ended");
                        break;
                    }
                };

                if !route_frame(&mut session, raw).await {
                    break;
                }
            }
        }
    }

    session.close().await;

    // The writer drains what is already queued, then closes the socket once the
    // last handle to the outbound queue is gone.
    if let Err(e) = writer.await {
        error!(error = %e, "Writer task failed");
    }
}

/// Route one client frame. Returns `false` if the connection must close.
async fn route_frame(session: &mut Session, raw: Bytes) -> bool {
    let size = raw.len();
    let start = Instant::now();

    match session.handle_frame(raw).await {
        Ok(route) => {
            metrics::record_route(route, size);
            metrics::record_latency(start.elapsed().as_secs_f64());
            true
        }
        Err(e) => {
            warn!(user = %session.user(), error = %e, "Closing connection");
            metrics::record_error("malformed");
            false
        }
    }
}

/// The connection's single writer.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    user: UserId,
) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = sink.send(to_message(payload)).await {
            // Dropping the receiver makes later deliveries fail fast; the reader
            // loop notices the dead socket on its own.
            warn!(user = %user, error = %e, "Write failed, dropping connection writer");
            metrics::record_error("write");
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(user = %user, error = %e, "Close failed");
    }
}

/// Payloads that are valid UTF-8 go out as text frames, anything else as binary.
fn to_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}
