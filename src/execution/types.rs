//! Execution state and audit log types

use crate::error::EngineError;
use crate::workflow::types::{TriggerType, WorkflowStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Execution lifecycle
///
/// `running -> {waiting, completed, failed, cancelled}`, `waiting -> {running, cancelled}`.
/// `completed`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        Self::Running,
        Self::Waiting,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Running, Running)
                | (Running, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Waiting, Running)
                | (Waiting, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::invalid(format!("unknown execution status '{}'", s)))
    }
}

/// One run of a workflow against one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub company_id: String,
    pub trigger_type: TriggerType,
    /// Snapshot of the triggering event payload
    pub trigger_data: Value,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub status: ExecutionStatus,
    /// `step_order` of the step to run next; also the optimistic concurrency token
    pub current_step_index: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for creating an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub company_id: String,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What a log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Started,
    Succeeded,
    Skipped,
    Waiting,
    Resumed,
    Branched,
    Retrying,
    Failed,
    Completed,
    Cancelled,
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EngineError::invalid(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(LogLevel {
    Debug => "debug",
    Info => "info",
    Warn => "warn",
    Error => "error",
});

string_enum!(LogOutcome {
    Started => "started",
    Succeeded => "succeeded",
    Skipped => "skipped",
    Waiting => "waiting",
    Resumed => "resumed",
    Branched => "branched",
    Retrying => "retrying",
    Failed => "failed",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// Append-only audit entry of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub execution_id: String,
    /// `None` for execution-level events
    pub step_id: Option<String>,
    pub step_order: Option<i64>,
    pub level: LogLevel,
    pub outcome: LogOutcome,
    pub message: String,
    pub details: Option<Value>,
    /// Position within the execution's log, starting at 1
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

/// Log entry waiting to be written alongside a state change
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub step_id: Option<String>,
    pub step_order: Option<i64>,
    pub level: LogLevel,
    pub outcome: LogOutcome,
    pub message: String,
    pub details: Option<Value>,
}

impl NewLogEntry {
    /// Execution-level entry
    pub fn execution(outcome: LogOutcome, message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            step_order: None,
            level: LogLevel::Info,
            outcome,
            message: message.into(),
            details: None,
        }
    }

    /// Entry attached to a step
    pub fn step(step: &WorkflowStep, outcome: LogOutcome, message: impl Into<String>) -> Self {
        Self {
            step_id: Some(step.id.clone()),
            step_order: Some(step.step_order),
            ..Self::execution(outcome, message)
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Target state of a compare-and-swap on an execution row
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub status: ExecutionStatus,
    pub current_step_index: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StateChange {
    pub fn running(step_index: i64) -> Self {
        Self {
            status: ExecutionStatus::Running,
            current_step_index: step_index,
            completed_at: None,
            error: None,
        }
    }

    pub fn waiting(step_index: i64) -> Self {
        Self {
            status: ExecutionStatus::Waiting,
            ..Self::running(step_index)
        }
    }

    pub fn completed(step_index: i64, at: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            completed_at: Some(at),
            ..Self::running(step_index)
        }
    }

    pub fn failed(step_index: i64, at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            completed_at: Some(at),
            error: Some(error.into()),
            ..Self::running(step_index)
        }
    }

    pub fn cancelled(step_index: i64, at: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            completed_at: Some(at),
            ..Self::running(step_index)
        }
    }
}

/// Execution together with its ordered audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution: WorkflowExecution,
    pub logs: Vec<ExecutionLog>,
}

/// Per-company counters for dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_workflows: i64,
    pub active_workflows: i64,
    pub total_executions: i64,
    /// Every status is present, zero when there are no executions in it
    pub executions_by_status: BTreeMap<String, i64>,
}
