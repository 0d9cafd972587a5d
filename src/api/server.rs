use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::observability::metrics::RenewalMetrics;
use crate::tls::challenge_handler::{http_challenge_path, is_valid_token};

#[derive(Clone)]
pub struct ServerState {
    pub metrics: Arc<RenewalMetrics>,
    /// Webroot HTTP-01 challenge files are written under
    pub webroot: PathBuf,
}

/// Build the router: health, metrics and HTTP-01 challenge files
pub fn create_server(bind_addr: &str, state: ServerState) -> Result<(SocketAddr, Router)> {
    let addr: SocketAddr = bind_addr.parse()?;

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/.well-known/acme-challenge/:token", get(acme_challenge))
        .with_state(state);

    info!("HTTP server configured to bind on {}", addr);

    Ok((addr, app))
}

/// Serve until `cancel` fires
pub async fn run_server(addr: SocketAddr, app: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export_metrics(),
    )
        .into_response()
}

/// Serve the key authorization a challenge handler wrote for `token`
async fn acme_challenge(Path(token): Path<String>, State(state): State<ServerState>) -> Response {
    if !is_valid_token(&token) {
        return (StatusCode::BAD_REQUEST, "Invalid token").into_response();
    }

    let path = http_challenge_path(&state.webroot, &token);
    match tokio::fs::read_to_string(&path).await {
        Ok(key_authorization) => {
            info!("Serving ACME challenge for token: {}", token);
            ([(header::CONTENT_TYPE, "text/plain")], key_authorization).into_response()
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("ACME challenge not found for token: {}", token);
            (StatusCode::NOT_FOUND, "Challenge not found").into_response()
        }
        Err(e) => {
            warn!("Failed to read challenge file {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Challenge unavailable").into_response()
        }
    }
}
