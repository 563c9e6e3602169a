//! Execution scheduler
//!
//! Polls the job queue, hands claimed jobs to the step interpreter under a
//! per-job timeout, and applies the retry policy to failures. A job that
//! runs out of attempts fails its execution.

use crate::config::WorkerConfig;
use crate::error::EngineResult;
use crate::execution::{ExecutionStatus, ExecutionStorage, LogLevel, LogOutcome, NewLogEntry, StateChange};
use crate::runtime::interpreter::{JobError, JobOutcome, StepInterpreter};
use crate::runtime::queue::{ClaimedJob, FollowUp, JobKind, JobQueue};
use crate::runtime::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

pub struct ExecutionScheduler {
    queue: JobQueue,
    executions: ExecutionStorage,
    interpreter: StepInterpreter,
    retry: RetryPolicy,
    config: WorkerConfig,
}

impl ExecutionScheduler {
    pub fn new(
        queue: JobQueue,
        executions: ExecutionStorage,
        interpreter: StepInterpreter,
        retry: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            executions,
            interpreter,
            retry,
            config,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Process every job due at `now`, one at a time; returns how many ran
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        self.queue.reclaim_stale(now).await?;
        let mut processed = 0;
        while let Some(job) = self.queue.claim(now, self.config.lease()).await? {
            self.process(job, now).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Poll loop; returns once `shutdown` flips to true and in-flight jobs finish
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let max_concurrency = self.config.max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrency));
        tracing::info!(
            "⚙️ Execution scheduler started (poll every {:?}, {} concurrent jobs)",
            self.config.poll_interval(),
            max_concurrency
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.reclaim_stale(Utc::now()).await {
                Ok(0) => {}
                Ok(reclaimed) => tracing::warn!("⚠️ Reclaimed {} jobs with expired leases", reclaimed),
                Err(e) => tracing::error!("❌ Failed to reclaim stale jobs: {}", e),
            }

            while let Ok(permit) = Arc::clone(&permits).try_acquire_owned() {
                match self.queue.claim(Utc::now(), self.config.lease()).await {
                    Ok(Some(job)) => {
                        let scheduler = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _permit = permit;
                            let job_id = job.id.clone();
                            if let Err(e) = scheduler.process(job, Utc::now()).await {
                                tracing::error!("❌ Job {} could not be settled: {}", job_id, e);
                            }
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("❌ Failed to claim job: {}", e);
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("⏹️ Execution scheduler stopping; waiting for in-flight jobs");
        let _ = permits.acquire_many(max_concurrency as u32).await;
        tracing::info!("✅ Execution scheduler stopped");
    }

    async fn process(&self, job: ClaimedJob, now: DateTime<Utc>) -> EngineResult<()> {
        let timeout = self.config.job_timeout();
        match tokio::time::timeout(timeout, self.interpreter.run_job(&job, now)).await {
            Ok(Ok(outcome)) => {
                if let JobOutcome::HandedOff { step_index } = outcome {
                    tracing::debug!(
                        "Execution {} handed off at step index {} after using its step budget",
                        job.execution_id,
                        step_index
                    );
                }
                self.queue.complete(&job.id).await
            }
            Ok(Err(error)) => {
                let step_id = match &error {
                    JobError::Step { step_id, .. } => Some(step_id.clone()),
                    JobError::Engine(_) => None,
                };
                self.handle_failure(&job, error.to_string(), step_id, now).await
            }
            Err(_) => {
                let error = format!("job timed out after {}s", timeout.as_secs_f64());
                self.handle_failure(&job, error, None, now).await
            }
        }
    }

    async fn handle_failure(
        &self,
        job: &ClaimedJob,
        error: String,
        step_id: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let Some(failed) = self.queue.record_failure(&job.id, &error).await? else {
            return Ok(());
        };

        // The execution moved on without this job; settle it quietly
        let expected_status = match failed.kind {
            JobKind::Advance => ExecutionStatus::Running,
            JobKind::Resume => ExecutionStatus::Waiting,
        };
        let current = self.executions.get_execution(&job.execution_id).await?;
        let still_owned = current.as_ref().is_some_and(|execution| {
            execution.status == expected_status && execution.current_step_index == failed.step_index
        });
        if !still_owned {
            tracing::debug!(
                "Dropping failed job {}: execution {} is no longer at step index {}",
                job.id,
                job.execution_id,
                failed.step_index
            );
            return self.queue.complete(&job.id).await;
        }

        // Waits never fail: a resume that keeps failing is retried at the capped interval
        let retry = failed.kind == JobKind::Resume || self.retry.has_attempts_remaining(failed.attempts);
        let entry = NewLogEntry {
            step_id,
            step_order: Some(failed.step_index),
            ..NewLogEntry::execution(LogOutcome::Retrying, error.clone())
        };

        if retry {
            let delay = self.retry.delay_for_attempt(failed.attempts + 1);
            let retry_at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            tracing::warn!(
                "⚠️ Job {} for execution {} failed (attempt {}): {}; retrying at {}",
                job.id,
                job.execution_id,
                failed.attempts,
                error,
                retry_at
            );
            let entry = entry
                .with_level(LogLevel::Warn)
                .with_details(json!({ "attempt": failed.attempts, "retry_at": retry_at }));
            self.executions.append_logs(&job.execution_id, &[entry]).await?;
            return self.queue.retry_at(&job.id, retry_at).await;
        }

        tracing::error!(
            "❌ Execution {} failed at step index {} after {} attempts: {}",
            job.execution_id,
            failed.step_index,
            failed.attempts,
            error
        );
        self.queue.bury(&job.id).await?;
        let entry = NewLogEntry {
            outcome: LogOutcome::Failed,
            level: LogLevel::Error,
            message: format!("Step failed after {} attempts: {}", failed.attempts, error),
            details: Some(json!({ "attempts": failed.attempts, "error": error })),
            ..entry
        };
        let swapped = self
            .executions
            .compare_and_swap(
                &job.execution_id,
                ExecutionStatus::Running,
                failed.step_index,
                StateChange::failed(failed.step_index, now, error),
                vec![entry],
                FollowUp::None,
            )
            .await?;
        if !swapped {
            tracing::debug!(
                "Execution {} moved on before its failed job was settled",
                job.execution_id
            );
        }
        Ok(())
    }
}
