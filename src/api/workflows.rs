/// Workflow authoring REST API endpoints
///
/// CRUD over workflows and their steps, reordering, activation and
/// template instantiation. Definition edits take effect on the next step
/// any in-flight execution evaluates.

use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::workflow::{
    NewStep, NewWorkflow, StepDraft, StepUpdate, TemplateOptions, Workflow, WorkflowStep,
    WorkflowTemplate, WorkflowUpdate,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Workflow with its steps in step order
#[derive(Debug, Serialize)]
pub struct WorkflowWithSteps {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub steps: Vec<WorkflowStep>,
}

/// Request body for workflow creation; steps are optional
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    #[serde(flatten)]
    pub workflow: NewWorkflow,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub company_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub step_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InstantiateTemplateRequest {
    pub company_id: String,
    #[serde(flatten)]
    pub options: TemplateOptions,
}

/// Create workflow authoring routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/activate", post(activate_workflow))
        .route("/api/workflows/{id}/deactivate", post(deactivate_workflow))
        .route("/api/workflows/{id}/steps", get(list_steps).post(add_step))
        .route("/api/workflows/{id}/steps/reorder", post(reorder_steps))
        .route("/api/steps/{id}", get(get_step).put(update_step).delete(delete_step))
        .route("/api/templates", get(list_templates))
        .route("/api/templates/{key}", post(instantiate_template))
}

/// POST /api/workflows
/// Body: { "company_id": "...", "name": "...", "trigger_type": "...", "steps": [...] }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowWithSteps>)> {
    let (workflow, steps) = state
        .engine
        .workflows()
        .create_workflow_with_steps(&payload.workflow, payload.steps)
        .await?;
    Ok((StatusCode::CREATED, Json(WorkflowWithSteps { workflow, steps })))
}

/// GET /api/workflows?company_id=...
async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> ApiResult<Json<Value>> {
    let workflows = state
        .engine
        .workflows()
        .list_workflows(query.company_id.as_deref())
        .await?;
    Ok(Json(json!({ "workflows": workflows })))
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<WorkflowWithSteps>> {
    let workflow = state.engine.workflows().require_workflow(&id).await?;
    let steps = state.engine.workflows().list_steps(&id).await?;
    Ok(Json(WorkflowWithSteps { workflow, steps }))
}

async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<WorkflowUpdate>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.workflows().update_workflow(&id, update).await?))
}

/// DELETE /api/workflows/{id}
///
/// Steps go with the workflow; past executions stay readable.
async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    if state.engine.workflows().delete_workflow(&id).await? {
        Ok(Json(json!({ "message": "Workflow deleted successfully" })))
    } else {
        Err(crate::error::EngineError::WorkflowNotFound(id).into())
    }
}

async fn activate_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.workflows().set_active(&id, true).await?))
}

async fn deactivate_workflow(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.engine.workflows().set_active(&id, false).await?))
}

async fn list_steps(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    state.engine.workflows().require_workflow(&id).await?;
    let steps = state.engine.workflows().list_steps(&id).await?;
    Ok(Json(json!({ "steps": steps })))
}

/// POST /api/workflows/{id}/steps
/// Body: { "action": { "type": "send_email", ... }, "insert_after": "step-id"? }
async fn add_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(step): Json<NewStep>,
) -> ApiResult<(StatusCode, Json<WorkflowStep>)> {
    let step = state.engine.workflows().add_step(&id, step).await?;
    Ok((StatusCode::CREATED, Json(step)))
}

/// POST /api/workflows/{id}/steps/reorder
/// Body: { "step_ids": ["...", "..."] } listing every step exactly once
async fn reorder_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<Json<Value>> {
    let steps = state
        .engine
        .workflows()
        .reorder_steps(&id, &request.step_ids)
        .await?;
    Ok(Json(json!({ "steps": steps })))
}

async fn get_step(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<WorkflowStep>> {
    state
        .engine
        .workflows()
        .get_step(&id)
        .await?
        .map(Json)
        .ok_or_else(|| crate::error::EngineError::StepNotFound(id).into())
}

async fn update_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StepUpdate>,
) -> ApiResult<Json<WorkflowStep>> {
    Ok(Json(state.engine.workflows().update_step(&id, update).await?))
}

async fn delete_step(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.engine.workflows().delete_step(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_templates() -> Json<Value> {
    Json(json!({ "templates": WorkflowTemplate::all() }))
}

/// POST /api/templates/{key}
/// Body: { "company_id": "...", "name": "..."?, "activate": false? }
async fn instantiate_template(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<InstantiateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowWithSteps>)> {
    let template = WorkflowTemplate::find(&key)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown template '{}'", key)))?;
    if request.company_id.trim().is_empty() {
        return Err(ApiError::BadRequest("company_id is required".to_string()));
    }

    let (new_workflow, drafts) = template.instantiate(&request.company_id, request.options);
    let (workflow, steps) = state
        .engine
        .workflows()
        .create_workflow_with_steps(&new_workflow, drafts)
        .await?;
    tracing::info!("📋 Created workflow {} from template {}", workflow.id, key);
    Ok((StatusCode::CREATED, Json(WorkflowWithSteps { workflow, steps })))
}
