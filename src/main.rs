//! pagewatch - web page change monitor
//!
//! Watches a CSS-selected fragment of each configured page, records every
//! check, and notifies through a local alert and an optional webhook when the
//! fragment changes.

mod config;
mod db;
mod monitor;
mod notify;
mod web;
mod webhook;

use config::ServerConfig;
use db::{ProjectRepository, SqliteStore};
use monitor::{HttpPageEnvironment, Monitor, MonitorOptions};
use notify::{LogAlertSink, Notifier};
use web::Server;
use webhook::Dispatcher;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pagewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting pagewatch on {}...", cfg.listen_addr());
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    let repo = ProjectRepository::new(store);
    tracing::info!("Database initialized successfully");

    let dispatcher = Dispatcher::new(repo.clone())?;
    let notifier = Notifier::new(Arc::new(LogAlertSink), dispatcher, repo.clone());

    let pages = Arc::new(HttpPageEnvironment::new(&cfg.user_agent, cfg.page_load_timeout)?);
    let options = MonitorOptions {
        load_timeout: cfg.page_load_timeout,
        ..Default::default()
    };
    let monitor = Monitor::new(repo.clone(), pages.clone(), pages, notifier.clone(), options);

    // Triggers are rebuilt from persisted state on every start
    monitor.resume_active().await?;

    // Start web server
    let server = Server::new(cfg, repo, monitor, notifier);
    server.start().await?;

    Ok(())
}
