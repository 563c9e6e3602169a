/// Workflow execution engine
///
/// Facade over the definition store, the execution store, the trigger
/// evaluator and the execution scheduler. This is the surface the HTTP layer
/// and embedding applications talk to.

use crate::config::WorkerConfig;
use crate::error::EngineResult;
use crate::execution::{
    ExecutionDetail, ExecutionStats, ExecutionStatus, ExecutionStorage, WorkflowExecution,
};
use crate::runtime::collaborators::Collaborators;
use crate::runtime::interpreter::StepInterpreter;
use crate::runtime::queue::JobQueue;
use crate::runtime::retry::RetryPolicy;
use crate::runtime::scheduler::ExecutionScheduler;
use crate::runtime::trigger::{TriggerEvaluator, TriggerEvent};
use crate::workflow::WorkflowStorage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct ExecutionEngine {
    workflows: WorkflowStorage,
    executions: ExecutionStorage,
    queue: JobQueue,
    triggers: TriggerEvaluator,
    scheduler: Arc<ExecutionScheduler>,
}

impl ExecutionEngine {
    /// Build an engine over an initialized pool
    pub fn new(pool: SqlitePool, collaborators: Arc<dyn Collaborators>, worker: &WorkerConfig) -> Self {
        Self::with_retry_policy(pool, collaborators, worker, RetryPolicy::from_worker_config(worker))
    }

    pub fn with_retry_policy(
        pool: SqlitePool,
        collaborators: Arc<dyn Collaborators>,
        worker: &WorkerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let workflows = WorkflowStorage::new(pool.clone());
        let executions = ExecutionStorage::new(pool.clone());
        let queue = JobQueue::new(pool);
        let interpreter = StepInterpreter::new(
            workflows.clone(),
            executions.clone(),
            collaborators,
            worker.step_budget,
        );
        let scheduler = ExecutionScheduler::new(
            queue.clone(),
            executions.clone(),
            interpreter,
            retry,
            worker.clone(),
        );

        Self {
            triggers: TriggerEvaluator::new(workflows.clone(), executions.clone()),
            workflows,
            executions,
            queue,
            scheduler: Arc::new(scheduler),
        }
    }

    pub fn workflows(&self) -> &WorkflowStorage {
        &self.workflows
    }

    pub fn executions(&self) -> &ExecutionStorage {
        &self.executions
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> Arc<ExecutionScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Ingest a business event; returns the executions it started
    pub async fn trigger(&self, event: &TriggerEvent) -> EngineResult<Vec<WorkflowExecution>> {
        self.trigger_at(event, Utc::now()).await
    }

    pub async fn trigger_at(&self, event: &TriggerEvent, now: DateTime<Utc>) -> EngineResult<Vec<WorkflowExecution>> {
        self.triggers.evaluate_event(event, now).await
    }

    /// Start a workflow directly; the execution is queued, not run inline
    pub async fn trigger_manual(
        &self,
        workflow_id: &str,
        entity_type: Option<String>,
        entity_id: Option<String>,
        trigger_data: Option<Value>,
    ) -> EngineResult<WorkflowExecution> {
        self.trigger_manual_at(workflow_id, entity_type, entity_id, trigger_data, Utc::now())
            .await
    }

    pub async fn trigger_manual_at(
        &self,
        workflow_id: &str,
        entity_type: Option<String>,
        entity_id: Option<String>,
        trigger_data: Option<Value>,
        now: DateTime<Utc>,
    ) -> EngineResult<WorkflowExecution> {
        self.triggers
            .trigger_manual(workflow_id, entity_type, entity_id, trigger_data, now)
            .await
    }

    /// Cancel a running or waiting execution
    ///
    /// Returns false when the execution had already finished.
    pub async fn cancel_execution(&self, execution_id: &str) -> EngineResult<bool> {
        let cancelled = self.executions.cancel(execution_id, Utc::now()).await?;
        if cancelled {
            tracing::info!("🛑 Cancelled execution {}", execution_id);
        } else {
            tracing::info!("Execution {} already finished; nothing to cancel", execution_id);
        }
        Ok(cancelled)
    }

    pub async fn get_execution_detail(&self, execution_id: &str) -> EngineResult<ExecutionDetail> {
        self.executions.get_detail(execution_id).await
    }

    pub async fn list_executions(
        &self,
        workflow_id: &str,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        self.executions.list_executions(workflow_id, status, limit).await
    }

    pub async fn get_stats(&self, company_id: &str) -> EngineResult<ExecutionStats> {
        let (total_workflows, active_workflows) = self.workflows.count_workflows(company_id).await?;
        let executions_by_status = self.executions.count_by_status(company_id).await?;
        Ok(ExecutionStats {
            total_workflows,
            active_workflows,
            total_executions: executions_by_status.values().sum(),
            executions_by_status,
        })
    }

    /// Cron tick: start scheduled workflows that fire at `now`
    pub async fn on_tick(&self, now: DateTime<Utc>) -> EngineResult<Vec<WorkflowExecution>> {
        self.triggers.evaluate_tick(now).await
    }

    /// Drain every job due at `now` in the calling task
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        self.scheduler.run_due_jobs(now).await
    }

    /// Run the scheduler's poll loop in the background until `shutdown` is set
    pub fn spawn_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        tokio::spawn(scheduler.run(shutdown))
    }
}
