//! Core workflow type definitions
//!
//! Workflows are persisted in SQLite as a header row plus one row per step.
//! Step configuration is a tagged union per step type, validated when the step
//! is authored so that a malformed step never reaches the interpreter.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Business event (or schedule) that starts a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    LeadStageChange,
    ClientCreated,
    EventDateApproaching,
    PaymentOverdue,
    RsvpReceived,
    ProposalAccepted,
    ContractSigned,
    Scheduled,
    Manual,
}

impl TriggerType {
    pub const ALL: [TriggerType; 9] = [
        Self::LeadStageChange,
        Self::ClientCreated,
        Self::EventDateApproaching,
        Self::PaymentOverdue,
        Self::RsvpReceived,
        Self::ProposalAccepted,
        Self::ContractSigned,
        Self::Scheduled,
        Self::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadStageChange => "lead_stage_change",
            Self::ClientCreated => "client_created",
            Self::EventDateApproaching => "event_date_approaching",
            Self::PaymentOverdue => "payment_overdue",
            Self::RsvpReceived => "rsvp_received",
            Self::ProposalAccepted => "proposal_accepted",
            Self::ContractSigned => "contract_signed",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    /// Triggers fired by business events (everything but cron and manual)
    pub fn is_event_based(&self) -> bool {
        !matches!(self, Self::Scheduled | Self::Manual)
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::invalid(format!("unknown trigger type '{}'", s)))
    }
}

/// Discriminant of [`StepAction`], stored in its own column for querying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    SendEmail,
    SendSms,
    SendWhatsapp,
    Wait,
    Condition,
    CreateTask,
    UpdateLead,
    UpdateClient,
    CreateNotification,
    Webhook,
}

impl StepType {
    pub const ALL: [StepType; 10] = [
        Self::SendEmail,
        Self::SendSms,
        Self::SendWhatsapp,
        Self::Wait,
        Self::Condition,
        Self::CreateTask,
        Self::UpdateLead,
        Self::UpdateClient,
        Self::CreateNotification,
        Self::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::SendSms => "send_sms",
            Self::SendWhatsapp => "send_whatsapp",
            Self::Wait => "wait",
            Self::Condition => "condition",
            Self::CreateTask => "create_task",
            Self::UpdateLead => "update_lead",
            Self::UpdateClient => "update_client",
            Self::CreateNotification => "create_notification",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::invalid(format!("unknown step type '{}'", s)))
    }
}

/// Unit of a wait step's duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
}

/// Longest wait a step may declare: ten years
const MAX_WAIT_DAYS: u32 = 3_650;

impl WaitUnit {
    /// Largest `duration` accepted for this unit
    pub fn max_amount(&self) -> u32 {
        match self {
            Self::Minutes => MAX_WAIT_DAYS * 24 * 60,
            Self::Hours => MAX_WAIT_DAYS * 24,
            Self::Days => MAX_WAIT_DAYS,
        }
    }

    pub fn duration(&self, amount: u32) -> chrono::Duration {
        let amount = i64::from(amount);
        match self {
            Self::Minutes => chrono::Duration::minutes(amount),
            Self::Hours => chrono::Duration::hours(amount),
            Self::Days => chrono::Duration::days(amount),
        }
    }
}

/// Where a condition reads its field from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionScope {
    /// Fresh read of the execution's entity at evaluation time
    #[default]
    EntityField,
    /// The trigger payload snapshot stored on the execution
    TriggerField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

impl ConditionOperator {
    /// Operators that ignore `value`
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// SMS and WhatsApp share the same shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub duration: u32,
    pub unit: WaitUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub condition_type: ConditionScope,
    /// JSONPath (`$.guest.rsvp_status`) or dotted name (`guest.rsvp_status`)
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_in_days: Option<u32>,
    #[serde(default)]
    pub assignee_id: Option<String>,
}

/// Field assignments for `update_lead` / `update_client`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdateConfig {
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

/// Typed step configuration, one variant per step type
///
/// Serialized with an inline `type` tag:
/// `{ "type": "wait", "duration": 1, "unit": "days" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    SendEmail(EmailConfig),
    SendSms(MessageConfig),
    SendWhatsapp(MessageConfig),
    Wait(WaitConfig),
    Condition(ConditionConfig),
    CreateTask(TaskConfig),
    UpdateLead(RecordUpdateConfig),
    UpdateClient(RecordUpdateConfig),
    CreateNotification(NotificationConfig),
    Webhook(WebhookConfig),
}

impl StepAction {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::SendEmail(_) => StepType::SendEmail,
            Self::SendSms(_) => StepType::SendSms,
            Self::SendWhatsapp(_) => StepType::SendWhatsapp,
            Self::Wait(_) => StepType::Wait,
            Self::Condition(_) => StepType::Condition,
            Self::CreateTask(_) => StepType::CreateTask,
            Self::UpdateLead(_) => StepType::UpdateLead,
            Self::UpdateClient(_) => StepType::UpdateClient,
            Self::CreateNotification(_) => StepType::CreateNotification,
            Self::Webhook(_) => StepType::Webhook,
        }
    }

    pub fn is_condition(&self) -> bool {
        matches!(self, Self::Condition(_))
    }

    /// Authoring-time validation of the per-type fields
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::SendEmail(config) => {
                if is_blank(&config.template_id) && is_blank(&config.body) {
                    return Err(EngineError::invalid("send_email requires a template_id or a body"));
                }
            }
            Self::SendSms(config) | Self::SendWhatsapp(config) => {
                if is_blank(&config.template_id) && is_blank(&config.message) {
                    return Err(EngineError::invalid(format!(
                        "{} requires a template_id or a message",
                        self.step_type()
                    )));
                }
            }
            Self::Wait(config) => {
                if config.duration == 0 {
                    return Err(EngineError::invalid("wait duration must be a positive integer"));
                }
                if config.duration > config.unit.max_amount() {
                    return Err(EngineError::invalid(format!(
                        "wait duration may not exceed {} {:?}",
                        config.unit.max_amount(),
                        config.unit
                    )));
                }
            }
            Self::Condition(config) => {
                if config.field.trim().is_empty() {
                    return Err(EngineError::invalid("condition requires a field"));
                }
                if !config.operator.is_unary() && config.value.is_null() {
                    return Err(EngineError::invalid(format!(
                        "condition operator {:?} requires a value",
                        config.operator
                    )));
                }
            }
            Self::CreateTask(config) => {
                if config.title.trim().is_empty() {
                    return Err(EngineError::invalid("create_task requires a title"));
                }
            }
            Self::UpdateLead(config) | Self::UpdateClient(config) => {
                if config.fields.is_empty() {
                    return Err(EngineError::invalid(format!(
                        "{} requires at least one field",
                        self.step_type()
                    )));
                }
            }
            Self::CreateNotification(config) => {
                if config.title.trim().is_empty() {
                    return Err(EngineError::invalid("create_notification requires a title"));
                }
            }
            Self::Webhook(config) => {
                let url = config.url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(EngineError::invalid("webhook url must be http(s)"));
                }
                if !matches!(
                    config.method.to_uppercase().as_str(),
                    "GET" | "POST" | "PUT" | "PATCH" | "DELETE"
                ) {
                    return Err(EngineError::invalid(format!(
                        "unsupported webhook method '{}'",
                        config.method
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// A named automation definition scoped to one company
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    /// Per-trigger-type filter, e.g. `{ "to_stage": "qualified" }`
    pub trigger_config: Map<String, Value>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Parsed cron schedule and timezone; `None` unless the trigger is `scheduled`
    pub fn schedule(&self) -> EngineResult<Option<(cron::Schedule, chrono_tz::Tz)>> {
        if self.trigger_type != TriggerType::Scheduled {
            return Ok(None);
        }
        let expression = self
            .cron_expression
            .as_deref()
            .ok_or_else(|| EngineError::invalid("scheduled workflow requires a cron expression"))?;
        Ok(Some((parse_cron(expression)?, parse_timezone(self.timezone.as_deref())?)))
    }
}

/// One node of a workflow's step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub step_order: i64,
    pub action: StepAction,
    /// Branch targets; only meaningful on condition steps
    pub on_true_step_id: Option<String>,
    pub on_false_step_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStep {
    pub fn step_type(&self) -> StepType {
        self.action.step_type()
    }
}

/// Authoring payload for a new workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub company_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Map<String, Value>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl NewWorkflow {
    pub fn validate(&self) -> EngineResult<()> {
        if self.company_id.trim().is_empty() {
            return Err(EngineError::invalid("company_id is required"));
        }
        validate_header(
            &self.name,
            self.trigger_type,
            self.cron_expression.as_deref(),
            self.timezone.as_deref(),
        )
    }
}

/// Partial update of a workflow header; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<Map<String, Value>>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl WorkflowUpdate {
    /// Apply onto an existing workflow, returning the validated result
    pub fn apply(self, mut workflow: Workflow) -> EngineResult<Workflow> {
        if let Some(name) = self.name {
            workflow.name = name;
        }
        if let Some(description) = self.description {
            workflow.description = Some(description);
        }
        if let Some(trigger_type) = self.trigger_type {
            workflow.trigger_type = trigger_type;
        }
        if let Some(trigger_config) = self.trigger_config {
            workflow.trigger_config = trigger_config;
        }
        if let Some(cron_expression) = self.cron_expression {
            workflow.cron_expression = Some(cron_expression);
        }
        if let Some(timezone) = self.timezone {
            workflow.timezone = Some(timezone);
        }
        if let Some(is_active) = self.is_active {
            workflow.is_active = is_active;
        }
        if workflow.trigger_type != TriggerType::Scheduled {
            workflow.cron_expression = None;
            workflow.timezone = None;
        }
        validate_header(
            &workflow.name,
            workflow.trigger_type,
            workflow.cron_expression.as_deref(),
            workflow.timezone.as_deref(),
        )?;
        Ok(workflow)
    }
}

/// Authoring payload for a new step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub action: StepAction,
    #[serde(default)]
    pub on_true_step_id: Option<String>,
    #[serde(default)]
    pub on_false_step_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Insert directly after this step instead of appending
    #[serde(default)]
    pub insert_after: Option<String>,
}

impl NewStep {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            on_true_step_id: None,
            on_false_step_id: None,
            is_active: true,
            insert_after: None,
        }
    }
}

/// Partial step update. Branch targets use a double option:
/// absent = unchanged, `null` = clear, `"id"` = set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepUpdate {
    #[serde(default)]
    pub action: Option<StepAction>,
    #[serde(default, with = "double_option")]
    pub on_true_step_id: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub on_false_step_id: Option<Option<String>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            None => serializer.serialize_none(),
            Some(inner) => inner.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

/// Step of a workflow created together with its steps; branches refer to list positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDraft {
    pub action: StepAction,
    #[serde(default)]
    pub on_true: Option<usize>,
    #[serde(default)]
    pub on_false: Option<usize>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl StepDraft {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            on_true: None,
            on_false: None,
            is_active: true,
        }
    }

    pub fn branches(mut self, on_true: Option<usize>, on_false: Option<usize>) -> Self {
        self.on_true = on_true;
        self.on_false = on_false;
        self
    }
}

fn validate_header(
    name: &str,
    trigger_type: TriggerType,
    cron_expression: Option<&str>,
    timezone: Option<&str>,
) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid("workflow name is required"));
    }
    match (trigger_type, cron_expression) {
        (TriggerType::Scheduled, None) => {
            Err(EngineError::invalid("scheduled workflow requires a cron expression"))
        }
        (TriggerType::Scheduled, Some(expression)) => {
            parse_cron(expression)?;
            parse_timezone(timezone)?;
            Ok(())
        }
        (_, Some(_)) => Err(EngineError::invalid(
            "cron expression is only allowed on scheduled workflows",
        )),
        (_, None) => Ok(()),
    }
}

/// Parse a cron expression; 5-field (minute precision) input gets a zero seconds field
pub fn parse_cron(expression: &str) -> EngineResult<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| EngineError::invalid(format!("invalid cron expression '{}': {}", expression, e)))
}

/// Parse an IANA timezone name; absent means UTC
pub fn parse_timezone(timezone: Option<&str>) -> EngineResult<chrono_tz::Tz> {
    match timezone.map(str::trim).filter(|tz| !tz.is_empty()) {
        None => Ok(chrono_tz::UTC),
        Some(name) => name
            .parse::<chrono_tz::Tz>()
            .map_err(|_| EngineError::invalid(format!("unknown timezone '{}'", name))),
    }
}
