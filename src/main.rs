/// Stepwise: durable workflow automation engine
///
/// Main entry point for the Stepwise server. Loads configuration and starts
/// the HTTP server together with the background job worker.

use stepwise::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow and step authoring at /api/workflows/* and /api/steps/*
/// - Event ingestion at /api/events
/// - Execution detail and cancellation at /api/executions/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();

    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
