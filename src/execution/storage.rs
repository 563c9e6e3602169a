//! SQLite persistence for executions and their audit logs (the execution store)
//!
//! Every state change goes through [`ExecutionStorage::compare_and_swap`]: the
//! row update is conditioned on the expected `(status, current_step_index)`,
//! and the log entries and follow-up job are written in the same transaction.
//! A mismatch rolls everything back, which is how duplicate or stale jobs are
//! turned into no-ops.

use crate::error::{EngineError, EngineResult};
use crate::execution::types::{
    ExecutionDetail, ExecutionLog, ExecutionStatus, LogLevel, LogOutcome, NewExecution,
    NewLogEntry, StateChange, WorkflowExecution,
};
use crate::runtime::queue::{self, FollowUp, JobKind, NewJob};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::BTreeMap;
use uuid::Uuid;

const EXECUTION_COLUMNS: &str = "id, workflow_id, company_id, trigger_type, trigger_data, entity_type, \
     entity_id, status, current_step_index, error, started_at, completed_at";

/// SQLite-backed execution storage
#[derive(Debug, Clone)]
pub struct ExecutionStorage {
    pool: SqlitePool,
}

impl ExecutionStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an execution and its first job atomically
    ///
    /// With `first_step_order = None` (no steps) the execution is created
    /// already completed and no job is queued.
    pub async fn create_execution(
        &self,
        new: NewExecution,
        first_step_order: Option<i64>,
        now: DateTime<Utc>,
    ) -> EngineResult<WorkflowExecution> {
        let execution = WorkflowExecution {
            id: Uuid::new_v4().to_string(),
            workflow_id: new.workflow_id,
            company_id: new.company_id,
            trigger_type: new.trigger_type,
            trigger_data: new.trigger_data,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            status: if first_step_order.is_some() {
                ExecutionStatus::Running
            } else {
                ExecutionStatus::Completed
            },
            current_step_index: first_step_order.unwrap_or(0),
            error: None,
            started_at: now,
            completed_at: if first_step_order.is_some() { None } else { Some(now) },
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, company_id, trigger_type, trigger_data,
                                             entity_type, entity_id, status, current_step_index,
                                             error, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.company_id)
        .bind(execution.trigger_type.as_str())
        .bind(serde_json::to_string(&execution.trigger_data)?)
        .bind(&execution.entity_type)
        .bind(&execution.entity_id)
        .bind(execution.status.as_str())
        .bind(execution.current_step_index)
        .bind(&execution.error)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&mut *tx)
        .await?;

        let mut logs = vec![NewLogEntry::execution(
            LogOutcome::Started,
            format!("Execution started by {} trigger", execution.trigger_type),
        )];
        match first_step_order {
            Some(step_index) => {
                queue::insert_job(
                    &mut *tx,
                    &NewJob {
                        execution_id: execution.id.clone(),
                        workflow_id: execution.workflow_id.clone(),
                        kind: JobKind::Advance,
                        step_index,
                        run_at: now,
                    },
                )
                .await?;
            }
            None => logs.push(NewLogEntry::execution(
                LogOutcome::Completed,
                "Workflow has no steps; execution completed",
            )),
        }
        insert_logs(&mut tx, &execution.id, &logs).await?;
        tx.commit().await?;

        Ok(execution)
    }

    pub async fn get_execution(&self, id: &str) -> EngineResult<Option<WorkflowExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM workflow_executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    pub async fn require_execution(&self, id: &str) -> EngineResult<WorkflowExecution> {
        self.get_execution(id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    /// Conditionally move an execution to `change`
    ///
    /// Returns `false` without writing anything when the stored status or step
    /// index no longer match the expected values.
    pub async fn compare_and_swap(
        &self,
        execution_id: &str,
        expected_status: ExecutionStatus,
        expected_index: i64,
        change: StateChange,
        logs: Vec<NewLogEntry>,
        follow_up: FollowUp,
    ) -> EngineResult<bool> {
        if !expected_status.can_transition_to(change.status) {
            return Err(EngineError::InvalidTransition {
                from: expected_status,
                to: change.status,
            });
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?, current_step_index = ?, completed_at = ?, error = COALESCE(?, error)
            WHERE id = ? AND status = ? AND current_step_index = ?
            "#,
        )
        .bind(change.status.as_str())
        .bind(change.current_step_index)
        .bind(change.completed_at)
        .bind(&change.error)
        .bind(execution_id)
        .bind(expected_status.as_str())
        .bind(expected_index)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_logs(&mut tx, execution_id, &logs).await?;
        queue::apply_follow_up(&mut tx, &follow_up).await?;
        if change.status.is_terminal() {
            queue::cancel_pending_for_execution(&mut tx, execution_id).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Cancel a running or waiting execution
    ///
    /// Returns `false` when the execution already reached a terminal state.
    /// Pending jobs are cancelled in the same transaction; a job that is
    /// already claimed sees the new status on its next compare-and-swap.
    pub async fn cancel(&self, execution_id: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        loop {
            let execution = self.require_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(false);
            }
            let swapped = self
                .compare_and_swap(
                    execution_id,
                    execution.status,
                    execution.current_step_index,
                    StateChange::cancelled(execution.current_step_index, now),
                    vec![NewLogEntry::execution(
                        LogOutcome::Cancelled,
                        format!("Execution cancelled while {}", execution.status),
                    )],
                    FollowUp::None,
                )
                .await?;
            if swapped {
                return Ok(true);
            }
            tracing::debug!("Execution {} changed during cancel, re-reading", execution_id);
        }
    }

    /// Append log entries without touching execution state
    pub async fn append_logs(&self, execution_id: &str, logs: &[NewLogEntry]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_logs(&mut tx, execution_id, logs).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Audit trail in write order
    pub async fn list_logs(&self, execution_id: &str) -> EngineResult<Vec<ExecutionLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, step_id, step_order, level, outcome, message, details, seq, created_at
            FROM workflow_execution_logs
            WHERE execution_id = ?
            ORDER BY seq
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    pub async fn get_detail(&self, execution_id: &str) -> EngineResult<ExecutionDetail> {
        let execution = self.require_execution(execution_id).await?;
        let logs = self.list_logs(execution_id).await?;
        Ok(ExecutionDetail { execution, logs })
    }

    /// Execution history of a workflow, newest first
    pub async fn list_executions(
        &self,
        workflow_id: &str,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_executions WHERE workflow_id = ? AND (? IS NULL OR status = ?) \
             ORDER BY started_at DESC, rowid DESC LIMIT ?",
            EXECUTION_COLUMNS
        ))
        .bind(workflow_id)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    /// Execution counts of a company keyed by status; every status is present
    pub async fn count_by_status(&self, company_id: &str) -> EngineResult<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM workflow_executions WHERE company_id = ? GROUP BY status",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<String, i64> = ExecutionStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        for (status, count) in rows {
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

/// Keep in-flight executions of a workflow on the same steps after every step
/// ordered above `after` moved by `delta`
///
/// Runs inside the authoring transaction that moves the steps. Returns the
/// number of executions whose step index changed.
pub(crate) async fn shift_in_flight(
    conn: &mut SqliteConnection,
    workflow_id: &str,
    after: i64,
    delta: i64,
) -> EngineResult<u64> {
    let shifted = sqlx::query(
        r#"
        UPDATE workflow_executions
        SET current_step_index = current_step_index + ?
        WHERE workflow_id = ? AND status IN ('running', 'waiting') AND current_step_index > ?
        "#,
    )
    .bind(delta)
    .bind(workflow_id)
    .bind(after)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if shifted > 0 {
        queue::shift_step_indexes(conn, workflow_id, after, delta, Utc::now()).await?;
    }
    Ok(shifted)
}

async fn insert_logs(
    conn: &mut SqliteConnection,
    execution_id: &str,
    logs: &[NewLogEntry],
) -> EngineResult<()> {
    for entry in logs {
        let details = entry.details.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO workflow_execution_logs (id, execution_id, step_id, step_order, level, outcome,
                                                 message, details, seq, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM workflow_execution_logs WHERE execution_id = ?),
                    ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(execution_id)
        .bind(&entry.step_id)
        .bind(entry.step_order)
        .bind(entry.level.as_str())
        .bind(entry.outcome.as_str())
        .bind(&entry.message)
        .bind(details)
        .bind(execution_id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn execution_from_row(row: &SqliteRow) -> EngineResult<WorkflowExecution> {
    let trigger_type: String = row.try_get("trigger_type")?;
    let trigger_data: String = row.try_get("trigger_data")?;
    let status: String = row.try_get("status")?;
    Ok(WorkflowExecution {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        company_id: row.try_get("company_id")?,
        trigger_type: trigger_type.parse()?,
        trigger_data: serde_json::from_str::<Value>(&trigger_data)?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        status: status.parse()?,
        current_step_index: row.try_get("current_step_index")?,
        error: row.try_get("error")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> EngineResult<ExecutionLog> {
    let level: String = row.try_get("level")?;
    let outcome: String = row.try_get("outcome")?;
    let details: Option<String> = row.try_get("details")?;
    Ok(ExecutionLog {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        step_id: row.try_get("step_id")?,
        step_order: row.try_get("step_order")?,
        level: level.parse::<LogLevel>()?,
        outcome: outcome.parse::<LogOutcome>()?,
        message: row.try_get("message")?,
        details: details.map(|raw| serde_json::from_str(&raw)).transpose()?,
        seq: row.try_get("seq")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}
