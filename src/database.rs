//! SQLite database bootstrap
//!
//! Opens the connection pool and creates the schema shared by the definition
//! store, the execution store and the job queue. All three live in one
//! database so that an execution transition, its log entries and its
//! follow-up job commit in a single transaction.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open (creating if missing) the database at `url` and initialize its schema
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| anyhow::anyhow!("Invalid database URL '{}': {}", url, e))?
        .create_if_missing(true)
        .foreign_keys(true);

    if let Some(parent) = Path::new(options.get_filename()).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
            })?;
        }
    }

    tracing::info!("🗄️ Opening workflow database: {}", options.get_filename().display());
    let pool = SqlitePool::connect_with(options).await?;
    init_schema(&pool).await?;
    tracing::info!("✅ Workflow database ready");

    Ok(pool)
}

/// Single-connection in-memory database, used by tests and embedded setups
///
/// The pool is pinned to one connection that never expires; otherwise every new
/// connection would see its own empty in-memory database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes (idempotent)
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            company_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            trigger_type TEXT NOT NULL,
            trigger_config JSON NOT NULL DEFAULT '{}',
            cron_expression TEXT,
            timezone TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_steps (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            step_order INTEGER NOT NULL,
            step_type TEXT NOT NULL,
            config JSON NOT NULL,
            on_true_step_id TEXT,
            on_false_step_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (workflow_id, step_order)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Executions keep their history when the workflow is deleted, hence no FK
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            company_id TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            trigger_data JSON NOT NULL DEFAULT '{}',
            entity_type TEXT,
            entity_id TEXT,
            status TEXT NOT NULL,
            current_step_index INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_execution_logs (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL REFERENCES workflow_executions(id) ON DELETE CASCADE,
            step_id TEXT,
            step_order INTEGER,
            level TEXT NOT NULL,
            outcome TEXT NOT NULL,
            message TEXT NOT NULL,
            details JSON,
            seq INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_jobs (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            run_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            locked_until INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the hot paths: trigger lookup, step sequencing, log replay, queue polling
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_workflows_company_trigger ON workflows(company_id, trigger_type, is_active)",
        "CREATE INDEX IF NOT EXISTS idx_steps_workflow_order ON workflow_steps(workflow_id, step_order)",
        "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions(workflow_id, started_at)",
        "CREATE INDEX IF NOT EXISTS idx_executions_company_status ON workflow_executions(company_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_logs_execution ON workflow_execution_logs(execution_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_due ON workflow_jobs(status, run_at)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_execution ON workflow_jobs(execution_id, status)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
