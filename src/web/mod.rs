//! Web server module.

mod handlers;
pub mod validation;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::ProjectRepository;
use crate::monitor::Monitor;
use crate::notify::Notifier;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub repo: ProjectRepository,
    pub monitor: Monitor,
    pub notifier: Notifier,
}

/// Web server for the command API.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        repo: ProjectRepository,
        monitor: Monitor,
        notifier: Notifier,
    ) -> Self {
        Self {
            state: AppState {
                config,
                repo,
                monitor,
                notifier,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/command", post(handlers::handle_command))
            .route("/api/projects", get(handlers::handle_get_projects))
            .route("/health", get(handlers::handle_health))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured address.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.state.config.listen_addr();
        let router = self.routes();

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Web server listening on {}", listener.local_addr()?);

        axum::serve(listener, router).await?;

        Ok(())
    }
}
