/// Runtime Execution Engine
///
/// This module drives workflow executions from trigger to terminal state.
/// It handles:
/// - Matching business events and cron ticks to active workflows
/// - A durable job queue with deferred delivery for waits
/// - Step interpretation with compare-and-swap progression
/// - The background worker loop, retries and per-job timeouts

// Engine facade used by the HTTP layer and embedders
pub mod engine;

// Event, cron and manual trigger evaluation
pub mod trigger;

// Step dispatch and execution state transitions
pub mod interpreter;

// Condition step evaluation over JSON documents
pub mod condition;

// Durable job queue backed by SQLite
pub mod queue;

// Worker loop with retry handling
pub mod scheduler;

// Retry backoff policy
pub mod retry;

// Minute tick for scheduled workflows
pub mod cron;

// Surrounding-system contracts (actions and entity reads)
pub mod collaborators;

// Re-export main types
pub use collaborators::{Collaborators, HttpCollaborators, RecordingCollaborators};
pub use cron::CronSchedulerService;
pub use engine::ExecutionEngine;
pub use interpreter::{JobOutcome, StepInterpreter};
pub use queue::{JobKind, JobQueue};
pub use retry::RetryPolicy;
pub use scheduler::ExecutionScheduler;
pub use trigger::{TriggerEvaluator, TriggerEvent};
