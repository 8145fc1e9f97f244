//! API Server - HTTP server for storage usage

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{self, AppState};
use crate::projection::ProjectionSynchronizer;

pub struct ApiServer {
    state: Arc<AppState>,
    addr: String,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(projections: Arc<ProjectionSynchronizer>, addr: String) -> Self {
        Self {
            state: Arc::new(AppState { projections }),
            addr,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let storage_routes = Router::new()
            .route("/storage/:user_id", get(handlers::get_summary))
            .route("/storage/:user_id/entities", get(handlers::list_entities));

        Router::new()
            .route("/health", get(handlers::health))
            .nest("/api", storage_routes)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the API server
    pub async fn run(&self) -> std::io::Result<()> {
        let router = self.router();

        info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
