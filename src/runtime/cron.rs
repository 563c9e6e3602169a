/// Background cron tick service
///
/// Fires once a minute through tokio-cron-scheduler and hands the tick to the
/// engine, which decides which scheduled workflows are due in their own
/// timezone. Workflow schedules are read from storage on every tick, so
/// definition changes need no job re-registration.

use crate::runtime::engine::ExecutionEngine;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Six-field expression: second 0 of every minute
const TICK_SCHEDULE: &str = "0 * * * * *";

pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    tick_job: RwLock<Option<Uuid>>,
    engine: Arc<ExecutionEngine>,
}

impl CronSchedulerService {
    pub async fn new(engine: Arc<ExecutionEngine>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            tick_job: RwLock::new(None),
            engine,
        })
    }

    /// Register the minute tick and start the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron tick service");

        let engine = Arc::clone(&self.engine);
        let job = Job::new_async(TICK_SCHEDULE, move |_uuid, _l| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!("🔔 Cron tick at {}", now);
                match engine.on_tick(now).await {
                    Ok(started) if started.is_empty() => {}
                    Ok(started) => {
                        tracing::info!("✅ Cron tick started {} scheduled executions", started.len());
                    }
                    Err(e) => tracing::error!("❌ Cron tick failed: {}", e),
                }
            })
        })?;

        {
            let scheduler = self.scheduler.read().await;
            let job_uuid = scheduler.add(job).await?;
            *self.tick_job.write().await = Some(job_uuid);
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron tick service started");
        Ok(())
    }

    /// Remove the tick job and shut the scheduler down
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron tick service");

        if let Some(job_uuid) = self.tick_job.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_uuid).await {
                tracing::warn!("⚠️ Failed to remove cron tick job: {}", e);
            }
        }

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Cron tick service stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.tick_job.read().await.is_some()
    }
}
