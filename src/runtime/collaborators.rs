//! Contracts with the surrounding system
//!
//! Action steps call out to collaborators (email, SMS, tasks, record updates,
//! notifications, webhooks) and condition steps read entities through them.
//! [`HttpCollaborators`] talks to the surrounding system over HTTP;
//! [`RecordingCollaborators`] keeps everything in memory and is what tests
//! and embedded setups use.

use crate::config::CollaboratorConfig;
use crate::workflow::types::{
    EmailConfig, MessageConfig, NotificationConfig, RecordUpdateConfig, StepAction, StepType,
    TaskConfig, WebhookConfig,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Collaborator failure; every variant is retried by the job runner
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator answered and refused the request
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("collaborator timed out")]
    Timeout,

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Unavailable(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

/// What a successful action call reports back
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// The execution an action is performed for
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub execution_id: String,
    pub company_id: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub trigger_data: Value,
}

pub type CollaboratorResult = Result<ActionReceipt, CollaboratorError>;

#[async_trait]
pub trait Collaborators: Send + Sync {
    async fn send_email(&self, config: &EmailConfig, ctx: &ActionContext) -> CollaboratorResult;

    async fn send_sms(&self, config: &MessageConfig, ctx: &ActionContext) -> CollaboratorResult;

    async fn send_whatsapp(&self, config: &MessageConfig, ctx: &ActionContext) -> CollaboratorResult;

    async fn create_task(&self, config: &TaskConfig, ctx: &ActionContext) -> CollaboratorResult;

    async fn update_lead(&self, config: &RecordUpdateConfig, ctx: &ActionContext) -> CollaboratorResult;

    async fn update_client(&self, config: &RecordUpdateConfig, ctx: &ActionContext) -> CollaboratorResult;

    async fn create_notification(
        &self,
        config: &NotificationConfig,
        ctx: &ActionContext,
    ) -> CollaboratorResult;

    async fn call_webhook(&self, config: &WebhookConfig, ctx: &ActionContext) -> CollaboratorResult;

    /// Current state of an entity, read fresh for condition evaluation
    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> Result<Value, CollaboratorError>;

    /// Dispatch an action step to the matching collaborator call
    async fn perform(&self, action: &StepAction, ctx: &ActionContext) -> CollaboratorResult {
        match action {
            StepAction::SendEmail(config) => self.send_email(config, ctx).await,
            StepAction::SendSms(config) => self.send_sms(config, ctx).await,
            StepAction::SendWhatsapp(config) => self.send_whatsapp(config, ctx).await,
            StepAction::CreateTask(config) => self.create_task(config, ctx).await,
            StepAction::UpdateLead(config) => self.update_lead(config, ctx).await,
            StepAction::UpdateClient(config) => self.update_client(config, ctx).await,
            StepAction::CreateNotification(config) => self.create_notification(config, ctx).await,
            StepAction::Webhook(config) => self.call_webhook(config, ctx).await,
            StepAction::Wait(_) | StepAction::Condition(_) => Err(CollaboratorError::Rejected(format!(
                "{} is not an external action",
                action.step_type()
            ))),
        }
    }
}

/// Collaborators reached over HTTP
///
/// Actions are posted to `{base_url}/actions/{step_type}`, entities are read
/// from `{base_url}/entities/{type}/{id}`, webhooks go to their own URL.
#[derive(Debug, Clone)]
pub struct HttpCollaborators {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
}

impl HttpCollaborators {
    pub fn new(config: &CollaboratorConfig) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_action<C: Serialize + Sync>(
        &self,
        step_type: StepType,
        config: &C,
        ctx: &ActionContext,
    ) -> CollaboratorResult {
        let url = format!("{}/actions/{}", self.base_url, step_type);
        tracing::debug!("🌍 Collaborator call: POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "entityType": ctx.entity_type,
                "entityId": ctx.entity_id,
                "executionId": ctx.execution_id,
                "companyId": ctx.company_id,
                "config": config,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Rejected(format!(
                "{} returned {}: {}",
                step_type, status, body
            )));
        }

        let reply: ActionResponse = response.json().await?;
        if !reply.success {
            return Err(CollaboratorError::Rejected(
                reply.error.unwrap_or_else(|| format!("{} reported failure", step_type)),
            ));
        }
        Ok(ActionReceipt {
            task_id: reply.task_id,
            status_code: Some(status.as_u16()),
        })
    }
}

#[async_trait]
impl Collaborators for HttpCollaborators {
    async fn send_email(&self, config: &EmailConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.post_action(StepType::SendEmail, config, ctx).await
    }

    async fn send_sms(&self, config: &MessageConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.post_action(StepType::SendSms, config, ctx).await
    }

    async fn send_whatsapp(&self, config: &MessageConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.post_action(StepType::SendWhatsapp, config, ctx).await
    }

    async fn create_task(&self, config: &TaskConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.post_action(StepType::CreateTask, config, ctx).await
    }

    async fn update_lead(&self, config: &RecordUpdateConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.post_action(StepType::UpdateLead, config, ctx).await
    }

    async fn update_client(&self, config: &RecordUpdateConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.post_action(StepType::UpdateClient, config, ctx).await
    }

    async fn create_notification(
        &self,
        config: &NotificationConfig,
        ctx: &ActionContext,
    ) -> CollaboratorResult {
        self.post_action(StepType::CreateNotification, config, ctx).await
    }

    async fn call_webhook(&self, config: &WebhookConfig, ctx: &ActionContext) -> CollaboratorResult {
        let method = config.method.to_uppercase();
        let mut request = match method.as_str() {
            "GET" => self.client.get(&config.url),
            "POST" => self.client.post(&config.url),
            "PUT" => self.client.put(&config.url),
            "PATCH" => self.client.patch(&config.url),
            "DELETE" => self.client.delete(&config.url),
            other => {
                return Err(CollaboratorError::Rejected(format!(
                    "unsupported webhook method '{}'",
                    other
                )))
            }
        };
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if method != "GET" {
            let body = match &config.body {
                Some(body) => body.clone(),
                None => serde_json::to_value(ctx)
                    .map_err(|e| CollaboratorError::Transport(e.to_string()))?,
            };
            request = request.json(&body);
        }

        tracing::debug!("🌍 Webhook: {} {}", method, config.url);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "webhook {} returned {}",
                config.url, status
            )));
        }
        Ok(ActionReceipt {
            task_id: None,
            status_code: Some(status.as_u16()),
        })
    }

    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> Result<Value, CollaboratorError> {
        let url = format!("{}/entities/{}/{}", self.base_url, entity_type, entity_id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "entity {}/{} lookup returned {}",
                entity_type, entity_id, status
            )));
        }
        Ok(response.json().await?)
    }
}

/// One call observed by [`RecordingCollaborators`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedCall {
    pub step_type: StepType,
    pub execution_id: String,
    pub entity_id: Option<String>,
    pub config: Value,
}

#[derive(Default)]
struct Recorder {
    calls: Vec<RecordedCall>,
    /// Remaining forced failures per step type; `None` fails forever
    failures: HashMap<StepType, Option<u32>>,
    latency: HashMap<StepType, Duration>,
    entities: HashMap<(String, String), Value>,
    entity_reads_fail: bool,
}

/// In-memory collaborators that record every call
///
/// This is primarily for testing. Failures and latency can be injected per
/// step type and entity state is whatever was last stored with
/// [`RecordingCollaborators::set_entity`].
#[derive(Default)]
pub struct RecordingCollaborators {
    inner: Mutex<Recorder>,
}

impl RecordingCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entity(&self, entity_type: &str, entity_id: &str, state: Value) {
        self.inner
            .lock()
            .entities
            .insert((entity_type.to_string(), entity_id.to_string()), state);
    }

    /// Fail the next `times` calls of `step_type`
    pub fn fail_times(&self, step_type: StepType, times: u32) {
        self.inner.lock().failures.insert(step_type, Some(times));
    }

    /// Fail every call of `step_type`
    pub fn fail_always(&self, step_type: StepType) {
        self.inner.lock().failures.insert(step_type, None);
    }

    pub fn fail_entity_reads(&self, fail: bool) {
        self.inner.lock().entity_reads_fail = fail;
    }

    /// Delay every call of `step_type`
    pub fn set_latency(&self, step_type: StepType, latency: Duration) {
        self.inner.lock().latency.insert(step_type, latency);
    }

    /// Successful calls in the order they happened
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().calls.clone()
    }

    pub fn calls_of(&self, step_type: StepType) -> Vec<RecordedCall> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.step_type == step_type)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, step_type: StepType) -> usize {
        self.calls_of(step_type).len()
    }

    async fn record<C: Serialize + Sync>(
        &self,
        step_type: StepType,
        config: &C,
        ctx: &ActionContext,
    ) -> CollaboratorResult {
        let latency = self.inner.lock().latency.get(&step_type).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.failures.get_mut(&step_type) {
            match remaining {
                None => {
                    return Err(CollaboratorError::Unavailable(format!("{} is down", step_type)));
                }
                Some(0) => {}
                Some(count) => {
                    *count -= 1;
                    return Err(CollaboratorError::Unavailable(format!("{} is down", step_type)));
                }
            }
        }

        inner.calls.push(RecordedCall {
            step_type,
            execution_id: ctx.execution_id.clone(),
            entity_id: ctx.entity_id.clone(),
            config: serde_json::to_value(config).unwrap_or(Value::Null),
        });
        let task_id = (step_type == StepType::CreateTask).then(|| format!("task-{}", inner.calls.len()));
        let status_code = (step_type == StepType::Webhook).then_some(200);
        Ok(ActionReceipt { task_id, status_code })
    }
}

#[async_trait]
impl Collaborators for RecordingCollaborators {
    async fn send_email(&self, config: &EmailConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::SendEmail, config, ctx).await
    }

    async fn send_sms(&self, config: &MessageConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::SendSms, config, ctx).await
    }

    async fn send_whatsapp(&self, config: &MessageConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::SendWhatsapp, config, ctx).await
    }

    async fn create_task(&self, config: &TaskConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::CreateTask, config, ctx).await
    }

    async fn update_lead(&self, config: &RecordUpdateConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::UpdateLead, config, ctx).await
    }

    async fn update_client(&self, config: &RecordUpdateConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::UpdateClient, config, ctx).await
    }

    async fn create_notification(
        &self,
        config: &NotificationConfig,
        ctx: &ActionContext,
    ) -> CollaboratorResult {
        self.record(StepType::CreateNotification, config, ctx).await
    }

    async fn call_webhook(&self, config: &WebhookConfig, ctx: &ActionContext) -> CollaboratorResult {
        self.record(StepType::Webhook, config, ctx).await
    }

    async fn fetch_entity(&self, entity_type: &str, entity_id: &str) -> Result<Value, CollaboratorError> {
        let inner = self.inner.lock();
        if inner.entity_reads_fail {
            return Err(CollaboratorError::Unavailable("entity store is down".to_string()));
        }
        inner
            .entities
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                CollaboratorError::Rejected(format!("entity {}/{} not found", entity_type, entity_id))
            })
    }
}
