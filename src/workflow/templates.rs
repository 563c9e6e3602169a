//! Built-in workflow templates
//!
//! A template is a ready-made header plus step drafts. Instantiating one goes
//! through `WorkflowStorage::create_workflow_with_steps`, so the workflow and
//! its branch wiring land in a single transaction.

use crate::workflow::types::{
    ConditionConfig, ConditionOperator, ConditionScope, EmailConfig, MessageConfig, NewWorkflow,
    NotificationConfig, StepAction, StepDraft, TaskConfig, TriggerType, WaitConfig, WaitUnit,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowTemplate {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub trigger_type: TriggerType,
    pub trigger_config: Map<String, Value>,
    pub steps: Vec<StepDraft>,
}

/// Overrides applied when a template is instantiated
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TemplateOptions {
    #[serde(default)]
    pub name: Option<String>,
    /// Templates are created inactive unless this is set
    #[serde(default)]
    pub activate: bool,
}

impl WorkflowTemplate {
    pub fn all() -> Vec<WorkflowTemplate> {
        vec![event_reminder(), new_client_welcome(), payment_overdue_followup()]
    }

    pub fn find(key: &str) -> Option<WorkflowTemplate> {
        Self::all().into_iter().find(|template| template.key == key)
    }

    /// Header and steps for a new workflow owned by `company_id`
    pub fn instantiate(&self, company_id: &str, options: TemplateOptions) -> (NewWorkflow, Vec<StepDraft>) {
        let workflow = NewWorkflow {
            company_id: company_id.to_string(),
            name: options.name.unwrap_or_else(|| self.name.to_string()),
            description: Some(self.description.to_string()),
            trigger_type: self.trigger_type,
            trigger_config: self.trigger_config.clone(),
            cron_expression: None,
            timezone: None,
            is_active: options.activate,
        };
        (workflow, self.steps.clone())
    }
}

fn config(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Remind, wait a day, then thank confirmed guests or chase the rest
fn event_reminder() -> WorkflowTemplate {
    WorkflowTemplate {
        key: "event_reminder",
        name: "Event reminder",
        description: "Reminds the client before the event and follows up on the RSVP",
        trigger_type: TriggerType::EventDateApproaching,
        trigger_config: config(json!({ "days_before": 3 })),
        steps: vec![
            StepDraft::new(StepAction::SendEmail(EmailConfig {
                template_id: Some("event_reminder".into()),
                subject: Some("Your event is coming up".into()),
                body: None,
            })),
            StepDraft::new(StepAction::Wait(WaitConfig {
                duration: 1,
                unit: WaitUnit::Days,
            })),
            StepDraft::new(StepAction::Condition(ConditionConfig {
                condition_type: ConditionScope::EntityField,
                field: "rsvp_status".into(),
                operator: ConditionOperator::Equals,
                value: json!("confirmed"),
            }))
            .branches(Some(3), Some(4)),
            StepDraft::new(StepAction::SendSms(MessageConfig {
                template_id: None,
                message: Some("Thanks for confirming, see you there!".into()),
            })),
            StepDraft::new(StepAction::CreateTask(TaskConfig {
                title: "Follow up on RSVP".into(),
                description: Some("Guest has not confirmed attendance".into()),
                due_in_days: Some(1),
                assignee_id: None,
            })),
        ],
    }
}

fn new_client_welcome() -> WorkflowTemplate {
    WorkflowTemplate {
        key: "new_client_welcome",
        name: "New client welcome",
        description: "Welcomes a new client and schedules a kickoff call",
        trigger_type: TriggerType::ClientCreated,
        trigger_config: Map::new(),
        steps: vec![
            StepDraft::new(StepAction::SendEmail(EmailConfig {
                template_id: Some("client_welcome".into()),
                subject: Some("Welcome aboard".into()),
                body: None,
            })),
            StepDraft::new(StepAction::Wait(WaitConfig {
                duration: 2,
                unit: WaitUnit::Days,
            })),
            StepDraft::new(StepAction::CreateTask(TaskConfig {
                title: "Schedule kickoff call".into(),
                description: None,
                due_in_days: Some(3),
                assignee_id: None,
            })),
        ],
    }
}

fn payment_overdue_followup() -> WorkflowTemplate {
    WorkflowTemplate {
        key: "payment_overdue_followup",
        name: "Payment overdue follow-up",
        description: "Nudges the client about an overdue invoice and escalates if still unpaid",
        trigger_type: TriggerType::PaymentOverdue,
        trigger_config: config(json!({ "min_days_overdue": 7 })),
        steps: vec![
            StepDraft::new(StepAction::SendEmail(EmailConfig {
                template_id: Some("payment_reminder".into()),
                subject: Some("Friendly payment reminder".into()),
                body: None,
            })),
            StepDraft::new(StepAction::Wait(WaitConfig {
                duration: 3,
                unit: WaitUnit::Days,
            })),
            StepDraft::new(StepAction::Condition(ConditionConfig {
                condition_type: ConditionScope::EntityField,
                field: "payment_status".into(),
                operator: ConditionOperator::NotEquals,
                value: json!("paid"),
            }))
            .branches(Some(3), None),
            StepDraft::new(StepAction::CreateNotification(NotificationConfig {
                title: "Invoice still unpaid".into(),
                message: Some("Client has not paid after a reminder".into()),
                recipient_id: None,
            })),
        ],
    }
}
