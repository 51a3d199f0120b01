//! Health and status HTTP endpoint for the merge loop (feature `server`)

use crate::constants;
use crate::runtime::MergerRuntime;
use crate::sync::{HealthState, LoopStatus};
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone)]
struct ServerState {
    health: Arc<HealthState>,
    status: Arc<Mutex<LoopStatus>>,
    start_time: Instant,
}

pub fn create_router(health: Arc<HealthState>, status: Arc<Mutex<LoopStatus>>) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/status", get(handle_status))
        .with_state(ServerState {
            health,
            status,
            start_time: Instant::now(),
        })
}

async fn handle_healthz(State(state): State<ServerState>) -> impl IntoResponse {
    if state.health.is_serving() {
        (StatusCode::OK, "SERVING")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_SERVING")
    }
}

async fn handle_status(State(state): State<ServerState>) -> impl IntoResponse {
    let loop_status = state.status.lock().unwrap().clone();
    axum::Json(json!({
        "server": {
            "version": constants::VERSION,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
            "serving": state.health.is_serving(),
        },
        "merger": loop_status,
    }))
}

/// Serve the endpoint until the runtime signals shutdown.
pub async fn serve(
    listen_addr: &str,
    health: Arc<HealthState>,
    status: Arc<Mutex<LoopStatus>>,
    runtime: MergerRuntime,
) -> Result<()> {
    let app = create_router(health, status);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding status server to {listen_addr}"))?;
    log::info!("status server listening on {listen_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(runtime.create_shutdown_future())
        .await
        .context("status server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthz_reflects_health_state() {
        let health = Arc::new(HealthState::new());
        let status = Arc::new(Mutex::new(LoopStatus::default()));
        let app = create_router(Arc::clone(&health), status);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = http_get(addr, "/healthz").await;
        assert!(response.contains("NOT_SERVING"));
    }

    // Minimal GET over a raw TcpStream; enough for asserting handler output
    // without pulling an HTTP client into the dev-dependencies.
    async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
