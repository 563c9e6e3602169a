//! Durable job queue on the `workflow_jobs` table
//!
//! A job asks the scheduler to advance one execution from one step index.
//! Jobs are delivered at least once. Claiming is a single `UPDATE .. RETURNING`
//! that skips any execution which already has a claimed job, so at most one
//! job per execution is in flight at a time.

use crate::error::EngineResult;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{Executor, Row, SqliteConnection};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Run the step at `step_index` of a running execution
    Advance,
    /// Wake a waiting execution whose wait step sits at `step_index`
    Resume,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advance => "advance",
            Self::Resume => "resume",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "resume" => Self::Resume,
            _ => Self::Advance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub execution_id: String,
    pub workflow_id: String,
    pub kind: JobKind,
    /// Idempotency fence: the execution's `current_step_index` when the job was issued
    pub step_index: i64,
    /// Not delivered before this instant
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub kind: JobKind,
    pub step_index: i64,
    /// Failed attempts so far
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
}

/// Queue row as stored, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub execution_id: String,
    pub kind: JobKind,
    pub step_index: i64,
    pub status: String,
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Queue write committed together with an execution state change
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    None,
    Enqueue(NewJob),
    /// Keep working on the claimed job: rewrite its kind and fence in place
    Carry {
        job_id: String,
        kind: JobKind,
        step_index: i64,
    },
}

/// Result of recording a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt {
    pub attempts: u32,
    pub kind: JobKind,
    pub step_index: i64,
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Insert a job using any executor (pool, connection or open transaction)
pub async fn insert_job<'e, E>(executor: E, job: &NewJob) -> EngineResult<String>
where
    E: Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO workflow_jobs (id, execution_id, workflow_id, kind, step_index, run_at, status, attempts, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?)
        "#,
    )
    .bind(&id)
    .bind(&job.execution_id)
    .bind(&job.workflow_id)
    .bind(job.kind.as_str())
    .bind(job.step_index)
    .bind(to_millis(job.run_at))
    .bind(to_millis(Utc::now()))
    .execute(executor)
    .await?;
    Ok(id)
}

/// Apply a follow-up inside the caller's transaction
pub async fn apply_follow_up(conn: &mut SqliteConnection, follow_up: &FollowUp) -> EngineResult<()> {
    match follow_up {
        FollowUp::None => {}
        FollowUp::Enqueue(job) => {
            insert_job(&mut *conn, job).await?;
        }
        FollowUp::Carry {
            job_id,
            kind,
            step_index,
        } => {
            sqlx::query(
                "UPDATE workflow_jobs SET kind = ?, step_index = ?, attempts = 0, last_error = NULL WHERE id = ?",
            )
            .bind(kind.as_str())
            .bind(step_index)
            .bind(job_id)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Cancel every pending job of an execution; claimed jobs finish on their own
pub async fn cancel_pending_for_execution(
    conn: &mut SqliteConnection,
    execution_id: &str,
) -> EngineResult<u64> {
    let result = sqlx::query(
        "UPDATE workflow_jobs SET status = 'cancelled' WHERE execution_id = ? AND status = 'pending'",
    )
    .bind(execution_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Move the fences of an edited workflow's live jobs along with its steps
///
/// Pending jobs are rewritten in place. A claimed job is mid-flight with the
/// old fence and will be discarded as stale, so a pending replacement carrying
/// the new fence is queued behind it.
pub async fn shift_step_indexes(
    conn: &mut SqliteConnection,
    workflow_id: &str,
    after: i64,
    delta: i64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE workflow_jobs
        SET step_index = step_index + ?
        WHERE workflow_id = ? AND status = 'pending' AND step_index > ?
          AND execution_id IN (
              SELECT id FROM workflow_executions WHERE status IN ('running', 'waiting')
          )
        "#,
    )
    .bind(delta)
    .bind(workflow_id)
    .bind(after)
    .execute(&mut *conn)
    .await?;

    let claimed = sqlx::query(
        r#"
        SELECT execution_id, kind, step_index FROM workflow_jobs
        WHERE workflow_id = ? AND status = 'claimed' AND step_index > ?
          AND execution_id IN (
              SELECT id FROM workflow_executions WHERE status IN ('running', 'waiting')
          )
        "#,
    )
    .bind(workflow_id)
    .bind(after)
    .fetch_all(&mut *conn)
    .await?;
    for row in &claimed {
        let kind: String = row.try_get("kind")?;
        let step_index: i64 = row.try_get("step_index")?;
        let replacement = NewJob {
            execution_id: row.try_get("execution_id")?,
            workflow_id: workflow_id.to_string(),
            kind: JobKind::parse(&kind),
            step_index: step_index + delta,
            run_at: now,
        };
        insert_job(&mut *conn, &replacement).await?;
    }
    Ok(())
}

/// Handle on the job table used by the scheduler
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(&self, job: &NewJob) -> EngineResult<String> {
        insert_job(&self.pool, job).await
    }

    /// Claim the oldest due job whose execution has nothing else in flight
    pub async fn claim(&self, now: DateTime<Utc>, lease: Duration) -> EngineResult<Option<ClaimedJob>> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5));
        let row = sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET status = 'claimed', locked_until = ?
            WHERE status = 'pending' AND id = (
                SELECT j.id FROM workflow_jobs j
                WHERE j.status = 'pending'
                  AND j.run_at <= ?
                  AND NOT EXISTS (
                      SELECT 1 FROM workflow_jobs c
                      WHERE c.execution_id = j.execution_id AND c.status = 'claimed'
                  )
                ORDER BY j.run_at, j.created_at
                LIMIT 1
            )
            RETURNING id, execution_id, workflow_id, kind, step_index, attempts, run_at
            "#,
        )
        .bind(to_millis(now + lease))
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(claimed_from_row).transpose()
    }

    /// The job is finished; nothing more will happen for it
    pub async fn complete(&self, job_id: &str) -> EngineResult<()> {
        self.set_status(job_id, "done").await
    }

    /// Count a failed attempt and release the lease
    pub async fn record_failure(&self, job_id: &str, error: &str) -> EngineResult<Option<FailedAttempt>> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_jobs
            SET attempts = attempts + 1, last_error = ?
            WHERE id = ?
            RETURNING attempts, kind, step_index
            "#,
        )
        .bind(error)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> EngineResult<FailedAttempt> {
            let attempts: i64 = row.try_get("attempts")?;
            let kind: String = row.try_get("kind")?;
            Ok(FailedAttempt {
                attempts: attempts.max(0) as u32,
                kind: JobKind::parse(&kind),
                step_index: row.try_get("step_index")?,
            })
        })
        .transpose()
    }

    /// Put a failed job back in the queue for a later attempt
    pub async fn retry_at(&self, job_id: &str, run_at: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query(
            "UPDATE workflow_jobs SET status = 'pending', run_at = ?, locked_until = NULL WHERE id = ?",
        )
        .bind(to_millis(run_at))
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Give up on a job after its last attempt
    pub async fn bury(&self, job_id: &str) -> EngineResult<()> {
        self.set_status(job_id, "dead").await
    }

    /// Return claimed jobs whose lease ran out (crashed worker) to the queue
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            "UPDATE workflow_jobs SET status = 'pending', locked_until = NULL WHERE status = 'claimed' AND locked_until < ?",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Earliest `run_at` among pending jobs
    pub async fn next_due(&self) -> EngineResult<Option<DateTime<Utc>>> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT MIN(run_at) FROM workflow_jobs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(next.map(from_millis))
    }

    pub async fn jobs_for_execution(&self, execution_id: &str) -> EngineResult<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, kind, step_index, status, attempts, run_at, last_error
            FROM workflow_jobs
            WHERE execution_id = ?
            ORDER BY created_at, run_at
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> EngineResult<JobRecord> {
                let kind: String = row.try_get("kind")?;
                let attempts: i64 = row.try_get("attempts")?;
                Ok(JobRecord {
                    id: row.try_get("id")?,
                    execution_id: row.try_get("execution_id")?,
                    kind: JobKind::parse(&kind),
                    step_index: row.try_get("step_index")?,
                    status: row.try_get("status")?,
                    attempts: attempts.max(0) as u32,
                    run_at: from_millis(row.try_get("run_at")?),
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }

    async fn set_status(&self, job_id: &str, status: &str) -> EngineResult<()> {
        sqlx::query("UPDATE workflow_jobs SET status = ?, locked_until = NULL WHERE id = ?")
            .bind(status)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn claimed_from_row(row: &SqliteRow) -> EngineResult<ClaimedJob> {
    let kind: String = row.try_get("kind")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(ClaimedJob {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        workflow_id: row.try_get("workflow_id")?,
        kind: JobKind::parse(&kind),
        step_index: row.try_get("step_index")?,
        attempts: attempts.max(0) as u32,
        run_at: from_millis(row.try_get("run_at")?),
    })
}
