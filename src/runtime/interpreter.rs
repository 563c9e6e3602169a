//! Step interpreter
//!
//! Runs one claimed job: re-reads the execution, checks the job's step index
//! against the stored one, performs the step and commits the transition with
//! a compare-and-swap. Fast steps are chained in-process up to the step
//! budget by carrying the same job forward; waits and budget exhaustion hand
//! off to a new queued job.

use crate::error::EngineError;
use crate::execution::{
    ExecutionStatus, ExecutionStorage, LogLevel, LogOutcome, NewLogEntry, StateChange,
    WorkflowExecution,
};
use crate::runtime::collaborators::{ActionContext, Collaborators};
use crate::runtime::condition::{self, ConditionError};
use crate::runtime::queue::{ClaimedJob, FollowUp, JobKind, NewJob};
use crate::workflow::graph::StepGraph;
use crate::workflow::types::{ConditionConfig, ConditionScope, StepAction, WorkflowStep};
use crate::workflow::WorkflowStorage;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Step index of an execution that has run past its last step
pub const END_OF_SEQUENCE: i64 = -1;

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Execution reached a terminal state
    Finished(ExecutionStatus),
    /// Execution is waiting; a resume job is queued
    Waiting { resume_at: DateTime<Utc> },
    /// Step budget used up; the next step is queued as a new job
    HandedOff { step_index: i64 },
    /// Job no longer matches the execution (duplicate, cancelled, or missing)
    Stale,
}

/// Retryable job failure
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("step {step_id} ({step_type}) failed: {message}")]
    Step {
        step_id: String,
        step_type: String,
        message: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

enum Next {
    Continue(i64),
    Wait(DateTime<Utc>),
    Done,
}

struct Transition {
    change: StateChange,
    logs: Vec<NewLogEntry>,
    next: Next,
}

impl Transition {
    fn complete(index: i64, now: DateTime<Utc>, mut logs: Vec<NewLogEntry>) -> Self {
        logs.push(NewLogEntry::execution(LogOutcome::Completed, "Execution completed"));
        Self {
            change: StateChange::completed(index, now),
            logs,
            next: Next::Done,
        }
    }

    /// Move to `next` (by step order) or complete when there is none
    fn proceed(index: i64, next: Option<&WorkflowStep>, now: DateTime<Utc>, logs: Vec<NewLogEntry>) -> Self {
        match next {
            Some(step) => Self {
                change: StateChange::running(step.step_order),
                logs,
                next: Next::Continue(step.step_order),
            },
            None => Self::complete(index, now, logs),
        }
    }
}

pub struct StepInterpreter {
    workflows: WorkflowStorage,
    executions: ExecutionStorage,
    collaborators: Arc<dyn Collaborators>,
    step_budget: u32,
}

impl StepInterpreter {
    pub fn new(
        workflows: WorkflowStorage,
        executions: ExecutionStorage,
        collaborators: Arc<dyn Collaborators>,
        step_budget: u32,
    ) -> Self {
        Self {
            workflows,
            executions,
            collaborators,
            step_budget: step_budget.max(1),
        }
    }

    /// Process a claimed job
    ///
    /// `now` is a lower bound for the step clock: each step runs at
    /// `max(now, wall clock)` so waits never resume early.
    pub async fn run_job(&self, job: &ClaimedJob, now: DateTime<Utc>) -> Result<JobOutcome, JobError> {
        let mut kind = job.kind;
        let mut token = job.step_index;
        let mut processed = 0u32;

        loop {
            let step_now = now.max(Utc::now());
            let Some(execution) = self.executions.get_execution(&job.execution_id).await? else {
                tracing::debug!("Discarding job {}: execution {} is gone", job.id, job.execution_id);
                return Ok(JobOutcome::Stale);
            };

            let expected_status = match kind {
                JobKind::Advance => ExecutionStatus::Running,
                JobKind::Resume => ExecutionStatus::Waiting,
            };
            if execution.current_step_index != token || execution.status != expected_status {
                tracing::debug!(
                    "Discarding stale job {} for execution {} (job at {} {:?}, execution at {} {})",
                    job.id,
                    execution.id,
                    token,
                    kind,
                    execution.current_step_index,
                    execution.status
                );
                return Ok(JobOutcome::Stale);
            }

            let graph = self.workflows.load_graph(&execution.workflow_id).await?;
            let transition = match kind {
                JobKind::Resume => self.resume(&execution, &graph),
                JobKind::Advance => match graph.at_order(token) {
                    Some(step) => self.run_step(&execution, &graph, step, step_now).await?,
                    None if token == END_OF_SEQUENCE => Transition::complete(token, step_now, Vec::new()),
                    // the step was deleted after this job was issued
                    None => {
                        let log = NewLogEntry {
                            step_order: Some(token),
                            ..NewLogEntry::execution(LogOutcome::Skipped, "Step no longer exists; continuing")
                        };
                        Transition::proceed(token, graph.fall_through(token), step_now, vec![log])
                    }
                },
            };

            processed += 1;
            let carry = processed < self.step_budget;
            let follow_up = match transition.next {
                Next::Continue(index) if carry => FollowUp::Carry {
                    job_id: job.id.clone(),
                    kind: JobKind::Advance,
                    step_index: index,
                },
                Next::Continue(index) => FollowUp::Enqueue(NewJob {
                    execution_id: execution.id.clone(),
                    workflow_id: execution.workflow_id.clone(),
                    kind: JobKind::Advance,
                    step_index: index,
                    run_at: now,
                }),
                Next::Wait(resume_at) => FollowUp::Enqueue(NewJob {
                    execution_id: execution.id.clone(),
                    workflow_id: execution.workflow_id.clone(),
                    kind: JobKind::Resume,
                    step_index: token,
                    run_at: resume_at,
                }),
                Next::Done => FollowUp::None,
            };

            let status = transition.change.status;
            let swapped = self
                .executions
                .compare_and_swap(
                    &execution.id,
                    expected_status,
                    token,
                    transition.change,
                    transition.logs,
                    follow_up,
                )
                .await?;
            if !swapped {
                tracing::debug!(
                    "Execution {} moved while job {} was running; dropping its result",
                    execution.id,
                    job.id
                );
                return Ok(JobOutcome::Stale);
            }

            match transition.next {
                Next::Continue(index) if carry => {
                    kind = JobKind::Advance;
                    token = index;
                }
                Next::Continue(index) => return Ok(JobOutcome::HandedOff { step_index: index }),
                Next::Wait(resume_at) => {
                    tracing::info!("⏸️ Execution {} waiting until {}", execution.id, resume_at);
                    return Ok(JobOutcome::Waiting { resume_at });
                }
                Next::Done => {
                    tracing::info!("🏁 Execution {} {}", execution.id, status);
                    return Ok(JobOutcome::Finished(status));
                }
            }
        }
    }

    fn resume(&self, execution: &WorkflowExecution, graph: &StepGraph) -> Transition {
        let wait_order = execution.current_step_index;
        let mut log = NewLogEntry::execution(LogOutcome::Resumed, "Wait elapsed; resuming");
        if let Some(wait_step) = graph.at_order(wait_order) {
            log = NewLogEntry::step(wait_step, LogOutcome::Resumed, "Wait elapsed; resuming");
        }
        // waiting -> completed is not a transition; run past the end and complete from running
        let next = graph
            .fall_through(wait_order)
            .map_or(END_OF_SEQUENCE, |step| step.step_order);
        Transition {
            change: StateChange::running(next),
            logs: vec![log],
            next: Next::Continue(next),
        }
    }

    async fn run_step(
        &self,
        execution: &WorkflowExecution,
        graph: &StepGraph,
        step: &WorkflowStep,
        now: DateTime<Utc>,
    ) -> Result<Transition, JobError> {
        if !step.is_active {
            tracing::debug!("⏭️ Skipping disabled step {} of execution {}", step.id, execution.id);
            let log = NewLogEntry::step(step, LogOutcome::Skipped, "Step disabled; skipped");
            return Ok(Transition::proceed(
                step.step_order,
                graph.fall_through(step.step_order),
                now,
                vec![log],
            ));
        }

        match &step.action {
            StepAction::Wait(config) => {
                let resume_at = now
                    .checked_add_signed(config.unit.duration(config.duration))
                    .ok_or_else(|| JobError::Step {
                        step_id: step.id.clone(),
                        step_type: step.step_type().to_string(),
                        message: format!("wait of {} {:?} is out of range", config.duration, config.unit),
                    })?;
                let log = NewLogEntry::step(
                    step,
                    LogOutcome::Waiting,
                    format!("Waiting {} {:?}", config.duration, config.unit),
                )
                .with_details(json!({ "resume_at": resume_at }));
                Ok(Transition {
                    change: StateChange::waiting(step.step_order),
                    logs: vec![log],
                    next: Next::Wait(resume_at),
                })
            }
            StepAction::Condition(config) => Ok(self.branch(execution, graph, step, config, now).await),
            action => {
                let ctx = ActionContext {
                    execution_id: execution.id.clone(),
                    company_id: execution.company_id.clone(),
                    entity_type: execution.entity_type.clone(),
                    entity_id: execution.entity_id.clone(),
                    trigger_data: execution.trigger_data.clone(),
                };
                tracing::debug!("⚡ Execution {} running {} step {}", execution.id, step.step_type(), step.id);
                let receipt = self
                    .collaborators
                    .perform(action, &ctx)
                    .await
                    .map_err(|e| JobError::Step {
                        step_id: step.id.clone(),
                        step_type: step.step_type().to_string(),
                        message: e.to_string(),
                    })?;
                let log = NewLogEntry::step(step, LogOutcome::Succeeded, format!("{} succeeded", step.step_type()))
                    .with_details(serde_json::to_value(&receipt).map_err(EngineError::from)?);
                Ok(Transition::proceed(
                    step.step_order,
                    graph.fall_through(step.step_order),
                    now,
                    vec![log],
                ))
            }
        }
    }

    async fn branch(
        &self,
        execution: &WorkflowExecution,
        graph: &StepGraph,
        step: &WorkflowStep,
        config: &ConditionConfig,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut logs = Vec::new();
        let outcome = match self.condition_source(execution, config).await {
            Ok(document) => condition::evaluate(config, &document),
            Err(e) => Err(e),
        };
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    "⚠️ Condition step {} of execution {} could not be evaluated, taking the false branch: {}",
                    step.id,
                    execution.id,
                    e
                );
                logs.push(
                    NewLogEntry::step(step, LogOutcome::Branched, format!("Condition error treated as false: {}", e))
                        .with_level(LogLevel::Warn),
                );
                false
            }
        };

        let target_id = if result {
            step.on_true_step_id.as_deref()
        } else {
            step.on_false_step_id.as_deref()
        };
        let target = graph.branch_target(target_id);
        let message = match target {
            Some(next) => format!("Condition {}; continuing at step {}", result, next.id),
            None => format!("Condition {}; no branch target, completing", result),
        };
        logs.push(
            NewLogEntry::step(step, LogOutcome::Branched, message)
                .with_details(json!({ "result": result, "target_step_id": target.map(|s| s.id.clone()) })),
        );

        Transition::proceed(step.step_order, target, now, logs)
    }

    /// Document a condition reads from: fresh entity state or the trigger snapshot
    async fn condition_source(
        &self,
        execution: &WorkflowExecution,
        config: &ConditionConfig,
    ) -> Result<Value, ConditionError> {
        match config.condition_type {
            ConditionScope::TriggerField => Ok(execution.trigger_data.clone()),
            ConditionScope::EntityField => {
                let (Some(entity_type), Some(entity_id)) =
                    (execution.entity_type.as_deref(), execution.entity_id.as_deref())
                else {
                    return Err(ConditionError::SourceUnavailable(
                        "execution has no entity to read".to_string(),
                    ));
                };
                self.collaborators
                    .fetch_entity(entity_type, entity_id)
                    .await
                    .map_err(|e| ConditionError::SourceUnavailable(e.to_string()))
            }
        }
    }
}
