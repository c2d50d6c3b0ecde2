//! HTTP API for cron definitions and the local crond.
//!
//! Provides REST endpoints for managing definitions and inspecting this
//! replica's engine.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{ApiState, ListCronsQuery};
pub use responses::*;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::CronService;
use crate::storage::Storage;

/// Configuration for the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8565,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid socket address {}:{}: {}", self.host, self.port, e),
            )
        })
    }
}

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health check
        .route("/api/health", get(handlers::health))
        // Definitions
        .route(
            "/api/crons",
            get(handlers::list_crons::<S>).post(handlers::create_cron::<S>),
        )
        .route(
            "/api/crons/{id}",
            get(handlers::get_cron::<S>)
                .put(handlers::update_cron::<S>)
                .delete(handlers::delete_cron::<S>),
        )
        .route("/api/crons/{id}/start", post(handlers::start_cron::<S>))
        .route("/api/crons/{id}/stop", post(handlers::stop_cron::<S>))
        // Local crond
        .route("/api/crond/entries", get(handlers::list_entries::<S>))
        .route("/api/crond/reload", post(handlers::reload_crond::<S>))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from the service.
pub fn create_api_state<S: Storage>(service: CronService<S>) -> ApiState<S> {
    ApiState { service }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server drains and exits once `shutdown` is cancelled.
pub async fn start_server<S: Storage + 'static>(
    config: ApiConfig,
    state: ApiState<S>,
    shutdown: CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let addr = config.socket_addr()?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
