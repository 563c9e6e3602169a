//! Configuration management for the Stepwise engine
//!
//! Handles server configuration, the SQLite connection, job runner tuning and
//! the collaborator endpoint. Every value can be overridden through a
//! `STEPWISE_*` environment variable for container deployment.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Job runner configuration
    pub worker: WorkerConfig,
    /// External collaborator endpoint
    pub collaborators: CollaboratorConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g., "sqlite://data/stepwise.db")
    /// The file and its parent directory are created when missing.
    pub url: String,
}

/// Background job runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How often the queue is polled for due jobs
    pub poll_interval_ms: u64,
    /// Maximum jobs processed concurrently by one worker
    pub max_concurrency: usize,
    /// Per-job timeout; a timed-out job is retried per the retry policy
    pub job_timeout_secs: u64,
    /// Steps processed in-process by one job before handing off to a new job
    pub step_budget: u32,
    /// Claim lease; jobs whose lease expired are returned to the queue
    pub lease_secs: u64,
    /// Attempts per step job, including the first
    pub retry_max_attempts: u32,
    /// Delay before the first retry
    pub retry_initial_ms: u64,
    /// Upper bound on retry delay
    pub retry_max_ms: u64,
    /// Whether the minute tick for scheduled workflows runs
    pub cron_enabled: bool,
}

/// Surrounding-system endpoint used for actions and entity reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Base URL, e.g. "http://localhost:3000/internal"
    pub base_url: String,
    /// Request timeout for every collaborator call
    pub timeout_secs: u64,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_concurrency: 8,
            job_timeout_secs: 30,
            step_budget: 10,
            lease_secs: 300,
            retry_max_attempts: 3,
            retry_initial_ms: 5_000,
            retry_max_ms: 300_000,
            cron_enabled: true,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let worker_defaults = WorkerConfig::default();
        Self {
            server: ServerConfig {
                host: env_or("STEPWISE_HOST", "0.0.0.0".to_string()),
                port: env_or("STEPWISE_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("STEPWISE_DATABASE_URL", "sqlite://data/stepwise.db".to_string()),
            },
            worker: WorkerConfig {
                poll_interval_ms: env_or("STEPWISE_POLL_INTERVAL_MS", worker_defaults.poll_interval_ms),
                max_concurrency: env_or("STEPWISE_MAX_CONCURRENCY", worker_defaults.max_concurrency),
                job_timeout_secs: env_or("STEPWISE_JOB_TIMEOUT_SECS", worker_defaults.job_timeout_secs),
                step_budget: env_or("STEPWISE_STEP_BUDGET", worker_defaults.step_budget),
                lease_secs: env_or("STEPWISE_LEASE_SECS", worker_defaults.lease_secs),
                retry_max_attempts: env_or("STEPWISE_RETRY_MAX_ATTEMPTS", worker_defaults.retry_max_attempts),
                retry_initial_ms: env_or("STEPWISE_RETRY_INITIAL_MS", worker_defaults.retry_initial_ms),
                retry_max_ms: env_or("STEPWISE_RETRY_MAX_MS", worker_defaults.retry_max_ms),
                cron_enabled: env_or("STEPWISE_CRON_ENABLED", worker_defaults.cron_enabled),
            },
            collaborators: CollaboratorConfig {
                base_url: env_or(
                    "STEPWISE_COLLABORATOR_URL",
                    "http://localhost:3000/internal".to_string(),
                ),
                timeout_secs: env_or("STEPWISE_COLLABORATOR_TIMEOUT_SECS", 10),
            },
        }
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
