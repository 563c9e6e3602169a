//! Trigger evaluator
//!
//! Turns business events, cron ticks and manual calls into new executions.
//! Matching only ever considers active workflows of the event's company;
//! lookup misses are logged and produce no execution.

use crate::error::{EngineError, EngineResult};
use crate::execution::{ExecutionStorage, NewExecution, WorkflowExecution};
use crate::runtime::condition::{as_number, loose_eq};
use crate::workflow::types::{TriggerType, Workflow};
use crate::workflow::WorkflowStorage;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Business event reported by the surrounding system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub company_id: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Whether a workflow's trigger config accepts an event payload
///
/// An empty config accepts every event of the type.
pub fn matches_trigger_config(trigger_type: TriggerType, config: &Map<String, Value>, payload: &Value) -> bool {
    match trigger_type {
        TriggerType::LeadStageChange => {
            expect_field(config.get("to_stage"), payload.get("new_stage"))
                && expect_field(config.get("from_stage"), payload.get("old_stage"))
        }
        TriggerType::EventDateApproaching => {
            expect_field(config.get("days_before"), payload.get("days_until_event"))
        }
        TriggerType::PaymentOverdue => match config.get("min_days_overdue").and_then(as_number) {
            None => true,
            Some(minimum) => payload
                .get("days_overdue")
                .and_then(as_number)
                .is_some_and(|days| days >= minimum),
        },
        _ => config
            .iter()
            .all(|(key, expected)| expect_field(Some(expected), payload.get(key))),
    }
}

fn expect_field(expected: Option<&Value>, actual: Option<&Value>) -> bool {
    match (expected, actual) {
        (None, _) | (Some(Value::Null), _) => true,
        (Some(expected), Some(actual)) => loose_eq(actual, expected),
        (Some(_), None) => false,
    }
}

/// Whether `now`, truncated to the minute in `tz`, is a firing time of `schedule`
pub fn cron_fires_at(schedule: &cron::Schedule, tz: chrono_tz::Tz, now: DateTime<Utc>) -> bool {
    now.with_timezone(&tz)
        .with_second(0)
        .and_then(|minute| minute.with_nanosecond(0))
        .is_some_and(|minute| schedule.includes(minute))
}

#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    workflows: WorkflowStorage,
    executions: ExecutionStorage,
}

impl TriggerEvaluator {
    pub fn new(workflows: WorkflowStorage, executions: ExecutionStorage) -> Self {
        Self { workflows, executions }
    }

    /// Start an execution of every active workflow the event matches
    pub async fn evaluate_event(
        &self,
        event: &TriggerEvent,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        if !event.trigger_type.is_event_based() {
            return Err(EngineError::invalid(format!(
                "{} is not a business event trigger",
                event.trigger_type
            )));
        }

        let candidates = self
            .workflows
            .find_active_by_trigger(&event.company_id, event.trigger_type)
            .await?;
        if candidates.is_empty() {
            tracing::info!(
                "🔍 No active {} workflows for company {}; event ignored",
                event.trigger_type,
                event.company_id
            );
            return Ok(Vec::new());
        }

        let mut started = Vec::new();
        for workflow in candidates {
            if !matches_trigger_config(event.trigger_type, &workflow.trigger_config, &event.payload) {
                tracing::debug!(
                    "Workflow {} trigger config does not match {} event",
                    workflow.id,
                    event.trigger_type
                );
                continue;
            }
            let result = self
                .start(
                    &workflow,
                    event.trigger_type,
                    event.entity_type.clone(),
                    event.entity_id.clone(),
                    event.payload.clone(),
                    now,
                )
                .await;
            match result {
                Ok(execution) => started.push(execution),
                Err(e) => tracing::error!(
                    "❌ Failed to start workflow {} for {} event: {}",
                    workflow.id,
                    event.trigger_type,
                    e
                ),
            }
        }
        Ok(started)
    }

    /// Start every active scheduled workflow whose cron expression fires at `now`
    ///
    /// Ticks are expected once per minute; a missed minute is not caught up.
    pub async fn evaluate_tick(&self, now: DateTime<Utc>) -> EngineResult<Vec<WorkflowExecution>> {
        let mut started = Vec::new();
        for workflow in self.workflows.list_active_scheduled().await? {
            let (schedule, tz) = match workflow.schedule() {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping scheduled workflow {}: {}", workflow.id, e);
                    continue;
                }
            };
            if !cron_fires_at(&schedule, tz, now) {
                continue;
            }
            let fired_at = now.with_timezone(&tz).with_second(0).unwrap_or_else(|| now.with_timezone(&tz));
            let payload = json!({
                "scheduled_at": fired_at.to_rfc3339(),
                "timezone": tz.name(),
            });
            match self
                .start(&workflow, TriggerType::Scheduled, None, None, payload, now)
                .await
            {
                Ok(execution) => started.push(execution),
                Err(e) => tracing::error!("❌ Failed to start scheduled workflow {}: {}", workflow.id, e),
            }
        }
        Ok(started)
    }

    /// Start a workflow directly, bypassing trigger matching
    ///
    /// The execution records `manual` as its trigger type whatever the
    /// workflow is configured with.
    pub async fn trigger_manual(
        &self,
        workflow_id: &str,
        entity_type: Option<String>,
        entity_id: Option<String>,
        trigger_data: Option<Value>,
        now: DateTime<Utc>,
    ) -> EngineResult<WorkflowExecution> {
        let workflow = match self.workflows.get_workflow(workflow_id).await? {
            Some(workflow) => workflow,
            None => {
                tracing::warn!("⚠️ Manual trigger for unknown workflow {}", workflow_id);
                return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
            }
        };
        if !workflow.is_active {
            tracing::warn!("⚠️ Manual trigger for inactive workflow {}", workflow_id);
            return Err(EngineError::WorkflowInactive(workflow_id.to_string()));
        }

        self.start(
            &workflow,
            TriggerType::Manual,
            entity_type,
            entity_id,
            trigger_data.unwrap_or_else(|| json!({})),
            now,
        )
        .await
    }

    async fn start(
        &self,
        workflow: &Workflow,
        trigger_type: TriggerType,
        entity_type: Option<String>,
        entity_id: Option<String>,
        trigger_data: Value,
        now: DateTime<Utc>,
    ) -> EngineResult<WorkflowExecution> {
        let graph = self.workflows.load_graph(&workflow.id).await?;
        let first_step = graph.first().map(|step| step.step_order);

        let execution = self
            .executions
            .create_execution(
                NewExecution {
                    workflow_id: workflow.id.clone(),
                    company_id: workflow.company_id.clone(),
                    trigger_type,
                    trigger_data,
                    entity_type,
                    entity_id,
                },
                first_step,
                now,
            )
            .await?;

        tracing::info!(
            "🚀 Started execution {} of workflow {} ({}) via {} trigger{}",
            execution.id,
            workflow.id,
            workflow.name,
            trigger_type,
            if first_step.is_none() { "; no steps, completed" } else { "" }
        );
        Ok(execution)
    }
}
