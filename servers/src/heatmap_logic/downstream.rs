use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use lib_heatmap::core::{BroadcastStats, DeliveryMode, FeedDisconnected, IngestStats, SubscriberInfo};

use crate::heatmap_logic::config::Settings;
use crate::heatmap_logic::state::AppState;

// Upper bound for the courtesy close frame sent to a dropped subscriber.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct MapParams {
    mode: Option<String>,
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub revision: u64,
    pub devices: usize,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub subscribers: Vec<SubscriberInfo>,
    pub ingest: IngestStats,
    pub broadcast: BroadcastStats,
    pub feeds: Vec<FeedDisconnected>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/ws/map", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(settings: Settings, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    serve(listener, state, shutdown).await
}

pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "downstream server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("downstream server shutting down");
        })
        .await
        .context("downstream server failed")
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let mut feeds: Vec<FeedDisconnected> = state
        .feed_disconnects
        .iter()
        .map(|e| e.value().clone())
        .collect();
    feeds.sort_by(|a, b| a.feed.cmp(&b.feed));

    Json(StatsResponse {
        revision: state.table.revision(),
        devices: state.table.len(),
        last_commit_at: state.table.last_commit_at(),
        subscribers: state.registry.info(),
        ingest: state.ingest.stats(),
        broadcast: state.broadcaster.stats(),
        feeds,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<MapParams>,
    State(state): State<AppState>,
) -> Response {
    let mode = match params.mode.as_deref().map(str::parse::<DeliveryMode>).transpose() {
        Ok(mode) => mode.unwrap_or_default(),
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, mode))
}

async fn handle_socket(socket: WebSocket, state: AppState, mode: DeliveryMode) {
    let mut subscription = state.broadcaster.subscribe(mode);
    let id = subscription.id();
    let cancel = subscription.cancellation();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = subscription.next_frame() => {
                // None: dropped for backlog or shutting down.
                let Some(frame) = frame else {
                    let _ = tokio::time::timeout(state.write_timeout.min(CLOSE_TIMEOUT), sender.send(Message::Close(None))).await;
                    break;
                };
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(subscription = %id, error = %e, "failed to encode frame");
                        continue;
                    }
                };
                // Unregistration cuts an in-flight write short.
                let written = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(subscription = %id, "subscription cancelled during write");
                        break;
                    }
                    res = tokio::time::timeout(state.write_timeout, sender.send(Message::Text(text.into()))) => res,
                };
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        let err = subscription.report_unreachable(e.to_string());
                        tracing::warn!(error = %err, "write failed");
                        break;
                    }
                    Err(_) => {
                        let err = subscription.report_unreachable(format!(
                            "write timed out after {}ms",
                            state.write_timeout.as_millis()
                        ));
                        tracing::warn!(error = %err, "write timed out");
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(subscription = %id, error = %e, "client read error");
                        break;
                    }
                    // Clients have nothing to say after subscribing.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    // Dropping the subscription unregisters it if it is still registered.
}
