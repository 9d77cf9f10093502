pub mod handler;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::check::CheckCoordinator;
use crate::errors::{QuotaError, Result};

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("HTTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<CheckCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/check", post(handler::check))
        .route("/health", get(handler::health))
        .route("/metrics", get(handler::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the check API until the listener fails
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<()> {
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| QuotaError::InternalError(format!("Failed to bind {}: {}", addr, e)))?;

    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| QuotaError::InternalError(format!("Server error: {}", e)))?;

    Ok(())
}
