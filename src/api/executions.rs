/// Execution REST API endpoints
///
/// Event ingestion, manual triggers, execution detail, cancellation and
/// per-company statistics.

use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::execution::{ExecutionDetail, ExecutionStats, ExecutionStatus, WorkflowExecution};
use crate::runtime::TriggerEvent;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct ManualTriggerRequest {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub trigger_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// Create execution routes
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events", post(ingest_event))
        .route("/api/workflows/{id}/trigger", post(trigger_manual))
        .route("/api/workflows/{id}/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/companies/{company_id}/stats", get(get_stats))
}

/// POST /api/events
///
/// Fire-and-forget: matching runs in the background and the caller gets 202.
async fn ingest_event(State(state): State<AppState>, Json(event): Json<TriggerEvent>) -> ApiResult<StatusCode> {
    if !event.trigger_type.is_event_based() {
        return Err(ApiError::BadRequest(format!(
            "{} is not a business event trigger",
            event.trigger_type
        )));
    }

    tracing::info!(
        "📥 Event {} received for company {}",
        event.trigger_type,
        event.company_id
    );
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.trigger(&event).await {
            tracing::error!(
                "❌ Failed to evaluate {} event for company {}: {}",
                event.trigger_type,
                event.company_id,
                e
            );
        }
    });
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/workflows/{id}/trigger
/// Body (optional): { "entity_type": "...", "entity_id": "...", "trigger_data": {...} }
async fn trigger_manual(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WorkflowExecution>)> {
    let request: ManualTriggerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ManualTriggerRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))?
    };
    let execution = state
        .engine
        .trigger_manual(&id, request.entity_type, request.entity_id, request.trigger_data)
        .await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

/// GET /api/workflows/{id}/executions?status=failed&limit=20
async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ExecutionStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);

    state.engine.workflows().require_workflow(&id).await?;
    let executions = state.engine.list_executions(&id, status, limit).await?;
    Ok(Json(json!({ "executions": executions })))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ExecutionDetail>> {
    Ok(Json(state.engine.get_execution_detail(&id).await?))
}

/// POST /api/executions/{id}/cancel
/// Returns: { "success": bool }; false when the execution had already finished
async fn cancel_execution(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let success = state.engine.cancel_execution(&id).await?;
    Ok(Json(json!({ "success": success })))
}

async fn get_stats(State(state): State<AppState>, Path(company_id): Path<String>) -> ApiResult<Json<ExecutionStats>> {
    Ok(Json(state.engine.get_stats(&company_id).await?))
}
