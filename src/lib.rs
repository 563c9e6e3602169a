/// Stepwise: durable workflow automation engine
///
/// Stores multi-step automations as data, starts them from business events,
/// cron ticks or manual calls, and drives each execution through actions,
/// waits and condition branches to a terminal state.

// Core configuration and setup
pub mod config;

// SQLite pool and schema
pub mod database;

// Engine error taxonomy
pub mod error;

// Definition store - workflows, steps, step graph and templates
pub mod workflow;

// Execution store - executions, audit logs, compare-and-swap transitions
pub mod execution;

// Runtime - triggers, step interpreter, job queue and scheduler
pub mod runtime;

// HTTP API layer - authoring, triggers and execution endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use runtime::{ExecutionEngine, TriggerEvent};
pub use server::start_server;
pub use workflow::{StepAction, Workflow, WorkflowStep};
