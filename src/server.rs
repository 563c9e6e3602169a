/// Server setup and initialization
///
/// Wires together all components: database, collaborators, execution engine,
/// background worker, cron tick and HTTP routes.

use crate::{
    api::create_router,
    config::Config,
    database,
    runtime::{CronSchedulerService, ExecutionEngine, HttpCollaborators},
};
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Running application: router plus the background services behind it
pub struct App {
    pub router: Router,
    pub engine: Arc<ExecutionEngine>,
    cron: Option<Arc<CronSchedulerService>>,
    worker: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl App {
    /// Stop the cron tick and let the worker finish its in-flight jobs
    pub async fn shutdown(self) -> Result<()> {
        if let Some(cron) = &self.cron {
            cron.stop().await?;
        }
        let _ = self.shutdown.send(true);
        self.worker.await?;
        Ok(())
    }
}

/// Create the application with all routes and background services
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("🗄️ Initializing workflow database");
    let pool = database::connect(&config.database.url).await?;

    tracing::info!("🔌 Collaborators at {}", config.collaborators.base_url);
    let collaborators = HttpCollaborators::new(&config.collaborators)
        .map_err(|e| anyhow::anyhow!("Failed to build collaborator client: {}", e))?;

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(ExecutionEngine::new(pool, Arc::new(collaborators), &config.worker));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let worker = engine.spawn_worker(shutdown_rx);

    let cron = if config.worker.cron_enabled {
        tracing::info!("⏰ Initializing cron tick service");
        let cron = Arc::new(CronSchedulerService::new(Arc::clone(&engine)).await?);
        cron.start().await?;
        Some(cron)
    } else {
        tracing::info!("⏰ Cron tick disabled; scheduled workflows will not fire");
        None
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = create_router(Arc::clone(&engine));

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        router,
        engine,
        cron,
        worker,
        shutdown,
    })
}

/// Start the HTTP server with the given configuration
///
/// Serves until Ctrl-C, then drains the worker before returning.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting Stepwise server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.router.clone().into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("⏹️ Shutdown signal received");
        })
        .await?;

    app.shutdown().await?;
    tracing::info!("Server shutdown complete");
    Ok(())
}
