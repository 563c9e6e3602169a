//! Workflow Definition Layer
//!
//! This module handles workflow definitions and their persistence:
//! - Type definitions (Workflow, WorkflowStep, typed step actions)
//! - Step graph arena with authoring-time validation
//! - SQLite persistence with sqlx
//! - Built-in templates

// Core workflow type definitions
pub mod types;

// Indexed step collection and branch resolution
pub mod graph;

// SQLite persistence layer for workflow definitions
pub mod storage;

// Ready-made workflows
pub mod templates;

// Re-export commonly used types
pub use graph::StepGraph;
pub use storage::WorkflowStorage;
pub use templates::{TemplateOptions, WorkflowTemplate};
pub use types::{
    NewStep, NewWorkflow, StepAction, StepDraft, StepType, StepUpdate, TriggerType, Workflow,
    WorkflowStep, WorkflowUpdate,
};
