//! HTTP server for the batch pipeline

pub mod routes;
pub mod state;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::BatchConfig;
use crate::error::Result;
use state::AppState;

/// Batch HTTP Server
pub struct BatchServer {
    config: BatchConfig,
    state: AppState,
}

impl BatchServer {
    /// Create a new server with the image converter
    pub async fn new(config: BatchConfig) -> Result<Self> {
        let state = AppState::new(config.clone()).await?;
        Ok(Self { config, state })
    }

    /// Create a server around existing state
    pub fn with_state(config: BatchConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        // CORS layer - must be added first (outermost)
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Health check
            .route("/health", get(health_check))
            // API routes with body limit for multipart uploads
            .nest("/api", routes::api_routes(self.config.upload_body_limit()))
            .with_state(self.state.clone())
            // Middleware layers (order matters - applied bottom to top)
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(cors)
    }

    /// Start the maintenance sweeper and serve until the listener fails
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| crate::error::Error::Config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();
        let sweeper = self
            .state
            .pipeline()
            .spawn_sweeper(self.config.storage.sweep_interval());

        tracing::info!("Starting batch server on http://{}", addr);
        tracing::info!("API documentation: http://{}/api/info", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::Error::Config(format!("Failed to bind: {}", e)))?;

        let served = axum::serve(listener, router)
            .await
            .map_err(|e| crate::error::Error::Internal(format!("Server error: {}", e)));

        sweeper.abort();
        self.state.pipeline().shutdown();
        served
    }

    /// Get the server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.server.host, self.config.server.port)
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
