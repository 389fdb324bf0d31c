// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Dash Contributors

// Tunnel Dash - REST API Module
// Dashboard page, service list, on-demand scans and tunnel control

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        Html, IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tunnel_dash_common::service::local_url;
use tunnel_dash_common::{
    render_html, HealthResponse, ScanResponse, Service, TunnelError, TunnelEvent,
    TunnelStatusResponse, Utc, ViewModel,
};

use crate::scanner::PortScanner;
use crate::tunnel::TunnelManager;

const DEFAULT_SCAN_RANGE: &str = "3000-9000";

/// Shared application state
pub struct AppState {
    pub tunnel_manager: TunnelManager,
    pub scanner: PortScanner,
    /// Services found by the last discovery pass
    pub services: RwLock<Vec<Service>>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

#[derive(Serialize)]
struct TunnelCreatedResponse {
    remote_port: u16,
    local_port: u16,
    url: String,
}

/// Lookup of a single tunnel
#[derive(Serialize)]
struct TunnelPortResponse {
    remote_port: u16,
    local_port: u16,
    healthy: bool,
    url: String,
}

#[derive(Deserialize)]
struct ScanQuery {
    range: Option<String>,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(health))
        .route("/api/services", get(list_services))
        .route("/api/scan", post(scan))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/:port", get(tunnel_status).post(create_tunnel))
        .route("/api/tunnels/:port/close", post(close_tunnel))
        .route("/api/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Dashboard page, rendered from the current services and tunnels
async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    let local_ports = state.tunnel_manager.port_map().await;
    let services = state.services.read().await;
    Html(render_html(&ViewModel::build(&services, &local_ports)))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        services: state.services.read().await.len(),
    })
}

async fn list_services(State(state): State<Arc<AppState>>) -> Json<Vec<Service>> {
    Json(state.services.read().await.clone())
}

/// Scan the remote host for listening ports
async fn scan(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanQuery>,
) -> impl IntoResponse {
    let range = query
        .range
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SCAN_RANGE.to_string());
    info!("API: Scan request for ports {}", range);

    match state.scanner.scan_ports(&range).await {
        Ok(ports) => (
            StatusCode::OK,
            Json(ScanResponse::Ports {
                count: ports.len(),
                ports,
            }),
        ),
        Err(e) => {
            error!("Scan failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ScanResponse::Error {
                    error: e.to_string(),
                }),
            )
        }
    }
}

/// List all tunnels with their health
async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<Vec<TunnelStatusResponse>> {
    let tunnels = state.tunnel_manager.list_tunnels().await;

    let mut response = Vec::with_capacity(tunnels.len());
    for info in tunnels {
        let healthy = state.tunnel_manager.health_check(info.remote_port).await;
        response.push(TunnelStatusResponse { info, healthy });
    }

    Json(response)
}

/// Local port and health of the tunnel for a remote port
async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    let Some(local_port) = state.tunnel_manager.local_port(port).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("No tunnel for remote port {}", port),
        );
    };

    Json(TunnelPortResponse {
        remote_port: port,
        local_port,
        healthy: state.tunnel_manager.health_check(port).await,
        url: local_url("http", local_port),
    })
    .into_response()
}

/// Open (or return the existing) tunnel for a remote port
async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    info!("API: Create tunnel request for remote port {}", port);

    match state.tunnel_manager.create_tunnel(port).await {
        Ok(local_port) => (
            StatusCode::OK,
            Json(TunnelCreatedResponse {
                remote_port: port,
                local_port,
                url: local_url("http", local_port),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to create tunnel for {}: {}", port, e);
            let status = match &e {
                TunnelError::InvalidPort(_) => StatusCode::BAD_REQUEST,
                TunnelError::PortsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                TunnelError::FailedImmediately { .. } => StatusCode::BAD_GATEWAY,
                TunnelError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e)
        }
    }
}

/// Close the tunnel for a remote port
async fn close_tunnel(
    State(state): State<Arc<AppState>>,
    Path(port): Path<u16>,
) -> impl IntoResponse {
    info!("API: Close tunnel request for remote port {}", port);

    if state.tunnel_manager.close_tunnel(port).await {
        (
            StatusCode::OK,
            Json(SuccessResponse {
                message: format!("Tunnel for port {} closed", port),
            }),
        )
            .into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            format!("No tunnel for remote port {}", port),
        )
    }
}

/// GET /api/events  → SSE stream of tunnel events
async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let tunnel_events = tunnel_event_payloads(state.tunnel_manager.subscribe());
    let merged = stream::select(tunnel_events, heartbeat_payloads())
        .map(|json| Ok(Event::default().data(json)));

    // Take events until shutdown signal is received
    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn tunnel_event_payloads(
    rx: broadcast::Receiver<TunnelEvent>,
) -> impl Stream<Item = String> + Send + 'static {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => event_payload(&event),
            Err(lagged) => {
                // Slow client; it picks up again with the next event
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    })
}

fn heartbeat_payloads() -> impl Stream<Item = String> + Send + 'static {
    IntervalStream::new(tokio::time::interval(heartbeat_interval())).filter_map(|_| async {
        event_payload(&TunnelEvent::Heartbeat {
            timestamp: Utc::now(),
        })
    })
}

fn event_payload(event: &TunnelEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize tunnel event: {e}");
            None
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}
