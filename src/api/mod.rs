/// HTTP API Layer
///
/// This module provides the REST API endpoints for the engine. It handles:
/// - Workflow and step authoring, reordering and templates
/// - Business event ingestion and manual triggers
/// - Execution detail, history, cancellation and stats

use crate::runtime::ExecutionEngine;
use axum::{routing::get, Router};
use std::sync::Arc;

// Error to response mapping
pub mod error;

// Workflow, step and template endpoints
pub mod workflows;

// Trigger and execution endpoints
pub mod executions;

// Re-export router builders
pub use executions::create_execution_routes;
pub use workflows::create_workflow_routes;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
}

/// Full router: health check plus every API route
pub fn create_router(engine: Arc<ExecutionEngine>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_execution_routes())
        .with_state(AppState { engine })
}

async fn health_check() -> &'static str {
    "ok"
}
