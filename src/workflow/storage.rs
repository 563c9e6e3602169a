//! SQLite persistence for workflow definitions (the definition store)
//!
//! Workflow headers live in `workflows`, steps in `workflow_steps`. Every
//! operation that touches `step_order` runs in one transaction and validates
//! the resulting step graph before writing, so orders stay unique and branch
//! targets never dangle. Deleting a step leaves a gap in the orders; the
//! successor of a step is the next higher order, so gaps are harmless and
//! `reorder_steps` closes them.

use crate::error::{EngineError, EngineResult};
use crate::execution::storage::shift_in_flight;
use crate::workflow::graph::StepGraph;
use crate::workflow::types::{
    NewStep, NewWorkflow, StepAction, StepDraft, StepUpdate, TriggerType, Workflow, WorkflowStep,
    WorkflowUpdate,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;
use uuid::Uuid;

const WORKFLOW_COLUMNS: &str = "id, company_id, name, description, trigger_type, trigger_config, \
     cron_expression, timezone, is_active, created_at, updated_at";

const STEP_COLUMNS: &str = "id, workflow_id, step_order, step_type, config, on_true_step_id, \
     on_false_step_id, is_active, created_at, updated_at";

/// SQLite-backed workflow and step storage
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool shared with the execution store
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a workflow header without steps
    pub async fn create_workflow(&self, new: &NewWorkflow) -> EngineResult<Workflow> {
        let (workflow, _) = self.create_workflow_with_steps(new, Vec::new()).await?;
        Ok(workflow)
    }

    /// Create a workflow and its ordered steps atomically
    ///
    /// Draft branch targets refer to positions in `drafts`; steps get orders
    /// `0..n` in list order.
    pub async fn create_workflow_with_steps(
        &self,
        new: &NewWorkflow,
        drafts: Vec<StepDraft>,
    ) -> EngineResult<(Workflow, Vec<WorkflowStep>)> {
        new.validate()?;

        let now = Utc::now();
        let mut workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            company_id: new.company_id.trim().to_string(),
            name: new.name.trim().to_string(),
            description: new.description.clone(),
            trigger_type: new.trigger_type,
            trigger_config: new.trigger_config.clone(),
            cron_expression: new.cron_expression.clone(),
            timezone: new.timezone.clone(),
            is_active: new.is_active,
            created_at: now,
            updated_at: now,
        };
        if workflow.trigger_type != TriggerType::Scheduled {
            workflow.timezone = None;
        }

        let ids: Vec<String> = drafts.iter().map(|_| Uuid::new_v4().to_string()).collect();
        let resolve = |position: Option<usize>| -> EngineResult<Option<String>> {
            position
                .map(|index| {
                    ids.get(index).cloned().ok_or_else(|| {
                        EngineError::invalid(format!("branch target position {} is out of range", index))
                    })
                })
                .transpose()
        };

        let mut steps = Vec::with_capacity(drafts.len());
        for (index, draft) in drafts.into_iter().enumerate() {
            draft.action.validate()?;
            steps.push(WorkflowStep {
                id: ids[index].clone(),
                workflow_id: workflow.id.clone(),
                step_order: index as i64,
                on_true_step_id: resolve(draft.on_true)?,
                on_false_step_id: resolve(draft.on_false)?,
                action: draft.action,
                is_active: draft.is_active,
                created_at: now,
                updated_at: now,
            });
        }
        StepGraph::new(steps.clone()).validate()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, company_id, name, description, trigger_type, trigger_config,
                                   cron_expression, timezone, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.company_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.trigger_type.as_str())
        .bind(serde_json::to_string(&workflow.trigger_config)?)
        .bind(&workflow.cron_expression)
        .bind(&workflow.timezone)
        .bind(workflow.is_active)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await?;

        for step in &steps {
            insert_step(&mut tx, step).await?;
        }
        tx.commit().await?;

        tracing::info!(
            "📋 Created workflow {} ({}) with {} steps for company {}",
            workflow.id,
            workflow.name,
            steps.len(),
            workflow.company_id
        );

        Ok((workflow, steps))
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: &str) -> EngineResult<Option<Workflow>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflows WHERE id = ?", WORKFLOW_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    /// Retrieve a workflow by ID, failing with `WorkflowNotFound`
    pub async fn require_workflow(&self, id: &str) -> EngineResult<Workflow> {
        self.get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    /// List workflows, optionally scoped to one company, newest first
    pub async fn list_workflows(&self, company_id: Option<&str>) -> EngineResult<Vec<Workflow>> {
        let rows = match company_id {
            Some(company_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM workflows WHERE company_id = ? ORDER BY created_at DESC",
                    WORKFLOW_COLUMNS
                ))
                .bind(company_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM workflows ORDER BY created_at DESC",
                    WORKFLOW_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(workflow_from_row).collect()
    }

    /// Active workflows of a company listening for `trigger_type`
    pub async fn find_active_by_trigger(
        &self,
        company_id: &str,
        trigger_type: TriggerType,
    ) -> EngineResult<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflows WHERE company_id = ? AND trigger_type = ? AND is_active = 1 \
             ORDER BY created_at",
            WORKFLOW_COLUMNS
        ))
        .bind(company_id)
        .bind(trigger_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    /// Active scheduled workflows across all companies (cron tick input)
    pub async fn list_active_scheduled(&self) -> EngineResult<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflows WHERE trigger_type = ? AND is_active = 1 ORDER BY created_at",
            WORKFLOW_COLUMNS
        ))
        .bind(TriggerType::Scheduled.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    /// Apply a partial header update
    pub async fn update_workflow(&self, id: &str, update: WorkflowUpdate) -> EngineResult<Workflow> {
        let mut workflow = update.apply(self.require_workflow(id).await?)?;
        workflow.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE workflows
            SET name = ?, description = ?, trigger_type = ?, trigger_config = ?,
                cron_expression = ?, timezone = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.trigger_type.as_str())
        .bind(serde_json::to_string(&workflow.trigger_config)?)
        .bind(&workflow.cron_expression)
        .bind(&workflow.timezone)
        .bind(workflow.is_active)
        .bind(workflow.updated_at)
        .bind(&workflow.id)
        .execute(&self.pool)
        .await?;

        tracing::info!("🔥 Updated workflow {} ({})", workflow.id, workflow.name);
        Ok(workflow)
    }

    /// Activate or deactivate a workflow; inactive workflows are never triggered
    pub async fn set_active(&self, id: &str, is_active: bool) -> EngineResult<Workflow> {
        self.update_workflow(
            id,
            WorkflowUpdate {
                is_active: Some(is_active),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a workflow; its steps go with it, executions are kept as history
    pub async fn delete_workflow(&self, id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::info!("🗑️ Deleted workflow {}", id);
        }
        Ok(deleted)
    }

    /// Steps of a workflow ordered by `step_order`
    pub async fn list_steps(&self, workflow_id: &str) -> EngineResult<Vec<WorkflowStep>> {
        let mut conn = self.pool.acquire().await?;
        load_steps(&mut conn, workflow_id).await
    }

    /// Steps of a workflow as a resolved graph
    pub async fn load_graph(&self, workflow_id: &str) -> EngineResult<StepGraph> {
        Ok(StepGraph::new(self.list_steps(workflow_id).await?))
    }

    pub async fn get_step(&self, step_id: &str) -> EngineResult<Option<WorkflowStep>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_steps WHERE id = ?", STEP_COLUMNS))
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    /// Append a step, or insert it right after `new.insert_after`
    ///
    /// Insertion shifts every later step down by one inside the same transaction.
    pub async fn add_step(&self, workflow_id: &str, new: NewStep) -> EngineResult<WorkflowStep> {
        new.action.validate()?;

        let mut tx = self.pool.begin().await?;
        ensure_workflow_exists(&mut tx, workflow_id).await?;
        let mut steps = load_steps(&mut tx, workflow_id).await?;

        let step_order = match new.insert_after.as_deref() {
            Some(anchor_id) => {
                let anchor = steps
                    .iter()
                    .find(|step| step.id == anchor_id)
                    .ok_or_else(|| EngineError::StepNotFound(anchor_id.to_string()))?;
                anchor.step_order + 1
            }
            None => steps.last().map_or(0, |last| last.step_order + 1),
        };

        let now = Utc::now();
        let step = WorkflowStep {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            step_order,
            action: new.action,
            on_true_step_id: new.on_true_step_id,
            on_false_step_id: new.on_false_step_id,
            is_active: new.is_active,
            created_at: now,
            updated_at: now,
        };

        for existing in steps.iter_mut().filter(|s| s.step_order >= step_order) {
            existing.step_order += 1;
        }
        steps.push(step.clone());
        StepGraph::new(steps).validate()?;

        shift_orders(&mut tx, workflow_id, step_order - 1, 1).await?;
        let moved = shift_in_flight(&mut tx, workflow_id, step_order - 1, 1).await?;
        insert_step(&mut tx, &step).await?;
        touch_workflow(&mut tx, workflow_id).await?;
        tx.commit().await?;

        if moved > 0 {
            tracing::debug!("{} in-flight executions of workflow {} kept on their steps", moved, workflow_id);
        }

        tracing::info!(
            "➕ Added {} step {} at order {} to workflow {}",
            step.step_type(),
            step.id,
            step.step_order,
            workflow_id
        );
        Ok(step)
    }

    /// Apply a partial step update
    ///
    /// Switching a condition step to another type drops its branch targets
    /// unless the update sets them explicitly (which then fails validation).
    pub async fn update_step(&self, step_id: &str, update: StepUpdate) -> EngineResult<WorkflowStep> {
        let mut tx = self.pool.begin().await?;
        let mut step = fetch_step(&mut tx, step_id).await?;

        let explicit_targets = matches!(update.on_true_step_id, Some(Some(_)))
            || matches!(update.on_false_step_id, Some(Some(_)));
        if let Some(action) = update.action {
            action.validate()?;
            step.action = action;
        }
        if let Some(target) = update.on_true_step_id {
            step.on_true_step_id = target;
        }
        if let Some(target) = update.on_false_step_id {
            step.on_false_step_id = target;
        }
        if let Some(is_active) = update.is_active {
            step.is_active = is_active;
        }
        if !step.action.is_condition() && !explicit_targets {
            step.on_true_step_id = None;
            step.on_false_step_id = None;
        }
        step.updated_at = Utc::now();

        let mut steps = load_steps(&mut tx, &step.workflow_id).await?;
        if let Some(slot) = steps.iter_mut().find(|s| s.id == step.id) {
            *slot = step.clone();
        }
        StepGraph::new(steps).validate()?;

        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET step_type = ?, config = ?, on_true_step_id = ?, on_false_step_id = ?,
                is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(step.step_type().as_str())
        .bind(serde_json::to_string(&step.action)?)
        .bind(&step.on_true_step_id)
        .bind(&step.on_false_step_id)
        .bind(step.is_active)
        .bind(step.updated_at)
        .bind(&step.id)
        .execute(&mut *tx)
        .await?;
        touch_workflow(&mut tx, &step.workflow_id).await?;
        tx.commit().await?;

        tracing::info!("✏️ Updated step {} of workflow {}", step.id, step.workflow_id);
        Ok(step)
    }

    /// Delete a step
    ///
    /// Branch references to it are nulled (a branch to a missing step completes
    /// the execution). Later steps keep their orders, so executions already
    /// past the deleted step are not shifted onto a step they have not reached.
    pub async fn delete_step(&self, step_id: &str) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, step_id).await?;

        let nulled_true = sqlx::query(
            "UPDATE workflow_steps SET on_true_step_id = NULL WHERE workflow_id = ? AND on_true_step_id = ?",
        )
        .bind(&step.workflow_id)
        .bind(step_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let nulled_false = sqlx::query(
            "UPDATE workflow_steps SET on_false_step_id = NULL WHERE workflow_id = ? AND on_false_step_id = ?",
        )
        .bind(&step.workflow_id)
        .bind(step_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM workflow_steps WHERE id = ?")
            .bind(step_id)
            .execute(&mut *tx)
            .await?;
        touch_workflow(&mut tx, &step.workflow_id).await?;
        tx.commit().await?;

        tracing::info!(
            "🗑️ Deleted step {} from workflow {} ({} branch references cleared)",
            step_id,
            step.workflow_id,
            nulled_true + nulled_false
        );
        Ok(())
    }

    /// Rewrite `step_order` of every step to its position in `ordered_step_ids`
    ///
    /// Rejected unless the id list is exactly the workflow's step set.
    pub async fn reorder_steps(
        &self,
        workflow_id: &str,
        ordered_step_ids: &[String],
    ) -> EngineResult<Vec<WorkflowStep>> {
        let mut tx = self.pool.begin().await?;
        ensure_workflow_exists(&mut tx, workflow_id).await?;
        let steps = load_steps(&mut tx, workflow_id).await?;

        let existing: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let requested: HashSet<&str> = ordered_step_ids.iter().map(String::as_str).collect();
        if requested.len() != ordered_step_ids.len() {
            return Err(EngineError::InvalidReorder("step ids contain duplicates".to_string()));
        }
        if requested != existing {
            let missing = existing.difference(&requested).count();
            let unknown = requested.difference(&existing).count();
            return Err(EngineError::InvalidReorder(format!(
                "step ids must match the workflow's steps exactly ({} missing, {} unknown)",
                missing, unknown
            )));
        }

        let now = Utc::now();
        let reordered: Vec<WorkflowStep> = ordered_step_ids
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                steps.iter().find(|s| &s.id == id).map(|s| WorkflowStep {
                    step_order: position as i64,
                    updated_at: now,
                    ..s.clone()
                })
            })
            .collect();
        StepGraph::new(reordered.clone()).validate()?;

        // Park every order in negative space first so the unique index never sees a collision
        sqlx::query("UPDATE workflow_steps SET step_order = -step_order - 1 WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;
        for step in &reordered {
            sqlx::query("UPDATE workflow_steps SET step_order = ?, updated_at = ? WHERE id = ?")
                .bind(step.step_order)
                .bind(step.updated_at)
                .bind(&step.id)
                .execute(&mut *tx)
                .await?;
        }
        touch_workflow(&mut tx, workflow_id).await?;
        tx.commit().await?;

        tracing::info!("🔀 Reordered {} steps of workflow {}", reordered.len(), workflow_id);
        Ok(reordered)
    }

    /// (total, active) workflow counts for a company
    pub async fn count_workflows(&self, company_id: &str) -> EngineResult<(i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(is_active), 0) AS active FROM workflows WHERE company_id = ?",
        )
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("total")?, row.try_get("active")?))
    }
}

async fn ensure_workflow_exists(conn: &mut SqliteConnection, workflow_id: &str) -> EngineResult<()> {
    let found: Option<(String,)> = sqlx::query_as("SELECT id FROM workflows WHERE id = ?")
        .bind(workflow_id)
        .fetch_optional(&mut *conn)
        .await?;
    found
        .map(|_| ())
        .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
}

async fn touch_workflow(conn: &mut SqliteConnection, workflow_id: &str) -> EngineResult<()> {
    sqlx::query("UPDATE workflows SET updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(workflow_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_steps(conn: &mut SqliteConnection, workflow_id: &str) -> EngineResult<Vec<WorkflowStep>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM workflow_steps WHERE workflow_id = ? ORDER BY step_order",
        STEP_COLUMNS
    ))
    .bind(workflow_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(step_from_row).collect()
}

async fn fetch_step(conn: &mut SqliteConnection, step_id: &str) -> EngineResult<WorkflowStep> {
    let row = sqlx::query(&format!("SELECT {} FROM workflow_steps WHERE id = ?", STEP_COLUMNS))
        .bind(step_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
    step_from_row(&row)
}

async fn insert_step(conn: &mut SqliteConnection, step: &WorkflowStep) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_steps (id, workflow_id, step_order, step_type, config, on_true_step_id,
                                    on_false_step_id, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&step.id)
    .bind(&step.workflow_id)
    .bind(step.step_order)
    .bind(step.step_type().as_str())
    .bind(serde_json::to_string(&step.action)?)
    .bind(&step.on_true_step_id)
    .bind(&step.on_false_step_id)
    .bind(step.is_active)
    .bind(step.created_at)
    .bind(step.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move every step with `step_order > after` by `delta`
///
/// SQLite checks the unique `(workflow_id, step_order)` index row by row, so the
/// rows are parked at `-order - 1` first and then brought back shifted.
async fn shift_orders(
    conn: &mut SqliteConnection,
    workflow_id: &str,
    after: i64,
    delta: i64,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE workflow_steps SET step_order = -step_order - 1 WHERE workflow_id = ? AND step_order > ?",
    )
    .bind(workflow_id)
    .bind(after)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE workflow_steps SET step_order = -step_order - 1 + ? WHERE workflow_id = ? AND step_order < 0",
    )
    .bind(delta)
    .bind(workflow_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn workflow_from_row(row: &SqliteRow) -> EngineResult<Workflow> {
    let trigger_type: String = row.try_get("trigger_type")?;
    let trigger_config: String = row.try_get("trigger_config")?;
    Ok(Workflow {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        trigger_type: trigger_type.parse()?,
        trigger_config: serde_json::from_str::<Map<String, Value>>(&trigger_config)?,
        cron_expression: row.try_get("cron_expression")?,
        timezone: row.try_get("timezone")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn step_from_row(row: &SqliteRow) -> EngineResult<WorkflowStep> {
    let config: String = row.try_get("config")?;
    Ok(WorkflowStep {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        step_order: row.try_get("step_order")?,
        action: serde_json::from_str::<StepAction>(&config)?,
        on_true_step_id: row.try_get("on_true_step_id")?,
        on_false_step_id: row.try_get("on_false_step_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect_in_memory;
    use crate::workflow::types::*;
    use serde_json::json;

    async fn storage() -> WorkflowStorage {
        WorkflowStorage::new(connect_in_memory().await.unwrap())
    }

    fn new_workflow(trigger_type: TriggerType) -> NewWorkflow {
        NewWorkflow {
            company_id: "co-1".into(),
            name: "Welcome sequence".into(),
            description: None,
            trigger_type,
            trigger_config: Map::new(),
            cron_expression: None,
            timezone: None,
            is_active: true,
        }
    }

    fn email(template: &str) -> StepAction {
        StepAction::SendEmail(EmailConfig {
            template_id: Some(template.into()),
            subject: None,
            body: None,
        })
    }

    fn condition() -> StepAction {
        StepAction::Condition(ConditionConfig {
            condition_type: ConditionScope::EntityField,
            field: "rsvp_status".into(),
            operator: ConditionOperator::Equals,
            value: json!("confirmed"),
        })
    }

    fn orders(steps: &[WorkflowStep]) -> Vec<(String, i64)> {
        steps.iter().map(|s| (s.id.clone(), s.step_order)).collect()
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let storage = storage().await;
        let workflow = storage
            .create_workflow(&new_workflow(TriggerType::ClientCreated))
            .await
            .unwrap();

        let loaded = storage.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Welcome sequence");
        assert_eq!(loaded.trigger_type, TriggerType::ClientCreated);
        assert!(loaded.is_active);
        assert!(storage.get_workflow("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_step_appends_and_inserts_after() {
        let storage = storage().await;
        let workflow = storage
            .create_workflow(&new_workflow(TriggerType::Manual))
            .await
            .unwrap();

        let first = storage.add_step(&workflow.id, NewStep::new(email("a"))).await.unwrap();
        let second = storage.add_step(&workflow.id, NewStep::new(email("b"))).await.unwrap();
        assert_eq!((first.step_order, second.step_order), (0, 1));

        let mut inserted = NewStep::new(email("between"));
        inserted.insert_after = Some(first.id.clone());
        let middle = storage.add_step(&workflow.id, inserted).await.unwrap();
        assert_eq!(middle.step_order, 1);

        let steps = storage.list_steps(&workflow.id).await.unwrap();
        assert_eq!(
            orders(&steps),
            vec![(first.id, 0), (middle.id, 1), (second.id, 2)]
        );
    }

    #[tokio::test]
    async fn test_add_step_to_unknown_workflow() {
        let storage = storage().await;
        let result = storage.add_step("nope", NewStep::new(email("a"))).await;
        assert!(matches!(result, Err(EngineError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_reorder_rewrites_every_order() {
        let storage = storage().await;
        let workflow = storage
            .create_workflow(&new_workflow(TriggerType::Manual))
            .await
            .unwrap();
        let a = storage.add_step(&workflow.id, NewStep::new(email("a"))).await.unwrap();
        let b = storage.add_step(&workflow.id, NewStep::new(email("b"))).await.unwrap();
        let c = storage.add_step(&workflow.id, NewStep::new(email("c"))).await.unwrap();

        storage
            .reorder_steps(&workflow.id, &[c.id.clone(), a.id.clone(), b.id.clone()])
            .await
            .unwrap();

        let steps = storage.list_steps(&workflow.id).await.unwrap();
        assert_eq!(orders(&steps), vec![(c.id, 0), (a.id, 1), (b.id, 2)]);
    }

    #[tokio::test]
    async fn test_reorder_with_missing_step_is_rejected() {
        let storage = storage().await;
        let workflow = storage
            .create_workflow(&new_workflow(TriggerType::Manual))
            .await
            .unwrap();
        let a = storage.add_step(&workflow.id, NewStep::new(email("a"))).await.unwrap();
        let b = storage.add_step(&workflow.id, NewStep::new(email("b"))).await.unwrap();
        let c = storage.add_step(&workflow.id, NewStep::new(email("c"))).await.unwrap();
        let before = orders(&storage.list_steps(&workflow.id).await.unwrap());

        let result = storage.reorder_steps(&workflow.id, &[c.id.clone(), a.id.clone()]).await;
        assert!(matches!(result, Err(EngineError::InvalidReorder(_))));

        let duplicate = storage
            .reorder_steps(&workflow.id, &[a.id.clone(), a.id.clone(), b.id.clone()])
            .await;
        assert!(matches!(duplicate, Err(EngineError::InvalidReorder(_))));

        assert_eq!(orders(&storage.list_steps(&workflow.id).await.unwrap()), before);
    }

    #[tokio::test]
    async fn test_delete_step_nulls_branch_references_and_keeps_orders() {
        let storage = storage().await;
        let (workflow, steps) = storage
            .create_workflow_with_steps(
                &new_workflow(TriggerType::Manual),
                vec![
                    StepDraft::new(condition()).branches(Some(1), Some(2)),
                    StepDraft::new(email("yes")),
                    StepDraft::new(email("no")),
                ],
            )
            .await
            .unwrap();

        storage.delete_step(&steps[1].id).await.unwrap();

        let remaining = storage.list_steps(&workflow.id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].on_true_step_id, None);
        assert_eq!(remaining[0].on_false_step_id.as_deref(), Some(steps[2].id.as_str()));
        assert_eq!(remaining[1].id, steps[2].id);
        assert_eq!(remaining[1].step_order, 2);

        // Appending continues after the highest order; reordering closes the gap
        let appended = storage.add_step(&workflow.id, NewStep::new(email("later"))).await.unwrap();
        assert_eq!(appended.step_order, 3);
        let ids: Vec<String> = storage.list_steps(&workflow.id).await.unwrap().into_iter().map(|s| s.id).collect();
        storage.reorder_steps(&workflow.id, &ids).await.unwrap();
        let dense: Vec<i64> = storage
            .list_steps(&workflow.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.step_order)
            .collect();
        assert_eq!(dense, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_delete_missing_step() {
        let storage = storage().await;
        assert!(matches!(
            storage.delete_step("ghost").await,
            Err(EngineError::StepNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_branch_validation_on_authoring() {
        let storage = storage().await;
        let workflow = storage
            .create_workflow(&new_workflow(TriggerType::Manual))
            .await
            .unwrap();
        let first = storage.add_step(&workflow.id, NewStep::new(email("a"))).await.unwrap();

        let mut dangling = NewStep::new(condition());
        dangling.on_true_step_id = Some("not-a-step".into());
        assert!(matches!(
            storage.add_step(&workflow.id, dangling).await,
            Err(EngineError::InvalidDefinition(_))
        ));

        let mut backwards = NewStep::new(condition());
        backwards.on_true_step_id = Some(first.id.clone());
        assert!(storage.add_step(&workflow.id, backwards).await.is_err());

        let mut on_action = NewStep::new(email("b"));
        on_action.on_true_step_id = Some(first.id.clone());
        assert!(storage.add_step(&workflow.id, on_action).await.is_err());

        assert_eq!(storage.list_steps(&workflow.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_step_switching_type_drops_branches() {
        let storage = storage().await;
        let (_, steps) = storage
            .create_workflow_with_steps(
                &new_workflow(TriggerType::Manual),
                vec![
                    StepDraft::new(condition()).branches(Some(1), None),
                    StepDraft::new(email("yes")),
                ],
            )
            .await
            .unwrap();

        let updated = storage
            .update_step(
                &steps[0].id,
                StepUpdate {
                    action: Some(email("now-an-email")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.step_type(), StepType::SendEmail);
        assert_eq!(updated.on_true_step_id, None);

        let disabled = storage
            .update_step(
                &steps[1].id,
                StepUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!disabled.is_active);
    }

    #[tokio::test]
    async fn test_delete_workflow_cascades_steps() {
        let storage = storage().await;
        let (workflow, steps) = storage
            .create_workflow_with_steps(
                &new_workflow(TriggerType::Manual),
                vec![StepDraft::new(email("a")), StepDraft::new(email("b"))],
            )
            .await
            .unwrap();

        assert!(storage.delete_workflow(&workflow.id).await.unwrap());
        assert!(storage.get_step(&steps[0].id).await.unwrap().is_none());
        assert!(!storage.delete_workflow(&workflow.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_trigger_lookup_skips_inactive() {
        let storage = storage().await;
        let active = storage
            .create_workflow(&new_workflow(TriggerType::RsvpReceived))
            .await
            .unwrap();
        let inactive = storage
            .create_workflow(&new_workflow(TriggerType::RsvpReceived))
            .await
            .unwrap();
        storage.set_active(&inactive.id, false).await.unwrap();

        let found = storage
            .find_active_by_trigger("co-1", TriggerType::RsvpReceived)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);

        assert_eq!(storage.count_workflows("co-1").await.unwrap(), (2, 1));
    }
}
