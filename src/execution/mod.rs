//! Execution Layer
//!
//! Durable execution state: one row per workflow run plus its append-only
//! audit log, with compare-and-swap transitions.

// Execution, status and log types
pub mod types;

// SQLite persistence with compare-and-swap transitions
pub mod storage;

pub use storage::ExecutionStorage;
pub use types::{
    ExecutionDetail, ExecutionLog, ExecutionStats, ExecutionStatus, LogLevel, LogOutcome,
    NewExecution, NewLogEntry, StateChange, WorkflowExecution,
};
