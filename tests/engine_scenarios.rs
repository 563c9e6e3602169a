//! End-to-end engine scenarios against an in-memory database
//!
//! Time is passed explicitly to `run_due_jobs`, so waits are exercised
//! without sleeping.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use stepwise::config::WorkerConfig;
use stepwise::database;
use stepwise::execution::{ExecutionStatus, LogLevel, LogOutcome};
use stepwise::runtime::{
    Collaborators, ExecutionEngine, JobKind, RecordingCollaborators, RetryPolicy, TriggerEvent,
};
use stepwise::runtime::queue::NewJob;
use stepwise::workflow::types::{
    ConditionConfig, ConditionOperator, ConditionScope, EmailConfig, MessageConfig,
    NotificationConfig, TaskConfig, WaitConfig, WaitUnit,
};
use stepwise::workflow::{
    NewStep, NewWorkflow, StepAction, StepDraft, StepType, TemplateOptions, TriggerType, Workflow,
    WorkflowStep, WorkflowTemplate,
};
use stepwise::EngineError;

const COMPANY: &str = "company-1";

struct Harness {
    engine: ExecutionEngine,
    collaborators: Arc<RecordingCollaborators>,
}

async fn harness_with(worker: WorkerConfig, retry: RetryPolicy) -> Harness {
    let pool = database::connect_in_memory().await.unwrap();
    let collaborators = Arc::new(RecordingCollaborators::new());
    let engine = ExecutionEngine::with_retry_policy(
        pool,
        collaborators.clone() as Arc<dyn Collaborators>,
        &worker,
        retry,
    );
    Harness { engine, collaborators }
}

async fn harness() -> Harness {
    harness_with(
        WorkerConfig::default(),
        RetryPolicy::fixed(Duration::from_secs(1), 3),
    )
    .await
}

fn manual_workflow(name: &str) -> NewWorkflow {
    NewWorkflow {
        company_id: COMPANY.to_string(),
        name: name.to_string(),
        description: None,
        trigger_type: TriggerType::Manual,
        trigger_config: Map::new(),
        cron_expression: None,
        timezone: None,
        is_active: true,
    }
}

async fn create(h: &Harness, new: NewWorkflow, steps: Vec<StepDraft>) -> (Workflow, Vec<WorkflowStep>) {
    h.engine
        .workflows()
        .create_workflow_with_steps(&new, steps)
        .await
        .unwrap()
}

fn email(subject: &str) -> StepAction {
    StepAction::SendEmail(EmailConfig {
        template_id: None,
        subject: Some(subject.to_string()),
        body: Some("Hello".to_string()),
    })
}

fn sms(message: &str) -> StepAction {
    StepAction::SendSms(MessageConfig {
        template_id: None,
        message: Some(message.to_string()),
    })
}

fn task(title: &str) -> StepAction {
    StepAction::CreateTask(TaskConfig {
        title: title.to_string(),
        description: None,
        due_in_days: None,
        assignee_id: None,
    })
}

fn notification(title: &str) -> StepAction {
    StepAction::CreateNotification(NotificationConfig {
        title: title.to_string(),
        message: None,
        recipient_id: None,
    })
}

fn wait(duration: u32, unit: WaitUnit) -> StepAction {
    StepAction::Wait(WaitConfig { duration, unit })
}

fn condition(scope: ConditionScope, field: &str, value: serde_json::Value) -> StepAction {
    StepAction::Condition(ConditionConfig {
        condition_type: scope,
        field: field.to_string(),
        operator: ConditionOperator::Equals,
        value,
    })
}

async fn status_of(h: &Harness, execution_id: &str) -> ExecutionStatus {
    h.engine
        .executions()
        .require_execution(execution_id)
        .await
        .unwrap()
        .status
}

async fn rsvp_scenario(rsvp_status: &str) -> (Harness, String) {
    let h = harness().await;
    let template = WorkflowTemplate::find("event_reminder").unwrap();
    let (new, drafts) = template.instantiate(
        COMPANY,
        TemplateOptions {
            name: None,
            activate: true,
        },
    );
    let (workflow, _) = create(&h, new, drafts).await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(
            &workflow.id,
            Some("client".to_string()),
            Some("client-123".to_string()),
            None,
            now,
        )
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.trigger_type, TriggerType::Manual);

    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 1);
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    // Not due yet
    h.engine.run_due_jobs(now + ChronoDuration::hours(23)).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    // Entity state is read when the condition runs, not at trigger time
    h.collaborators
        .set_entity("client", "client-123", json!({ "rsvp_status": rsvp_status }));
    h.engine
        .run_due_jobs(now + ChronoDuration::days(1) + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);

    (h, execution.id)
}

#[tokio::test]
async fn test_rsvp_confirmed_sends_thanks() {
    let (h, execution_id) = rsvp_scenario("confirmed").await;
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 1);
    assert_eq!(h.collaborators.call_count(StepType::CreateTask), 0);

    let detail = h.engine.get_execution_detail(&execution_id).await.unwrap();
    let outcomes: Vec<LogOutcome> = detail.logs.iter().map(|log| log.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            LogOutcome::Started,
            LogOutcome::Succeeded,
            LogOutcome::Waiting,
            LogOutcome::Resumed,
            LogOutcome::Branched,
            LogOutcome::Succeeded,
            LogOutcome::Completed,
        ]
    );
    let seqs: Vec<i64> = detail.logs.iter().map(|log| log.seq).collect();
    assert_eq!(seqs, (1..=7).collect::<Vec<_>>());
    assert!(detail.execution.completed_at.is_some());
}

#[tokio::test]
async fn test_rsvp_unconfirmed_creates_follow_up_task() {
    let (h, _) = rsvp_scenario("pending").await;
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 0);
    let tasks = h.collaborators.calls_of(StepType::CreateTask);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].entity_id.as_deref(), Some("client-123"));
    assert_eq!(tasks[0].config["title"], "Follow up on RSVP");
}

#[tokio::test]
async fn test_inactive_workflow_never_starts() {
    let h = harness().await;
    let mut new = manual_workflow("Welcome");
    new.trigger_type = TriggerType::ClientCreated;
    new.is_active = false;
    let (workflow, _) = create(&h, new, vec![StepDraft::new(email("Welcome"))]).await;

    let event = TriggerEvent {
        company_id: COMPANY.to_string(),
        trigger_type: TriggerType::ClientCreated,
        entity_type: Some("client".to_string()),
        entity_id: Some("client-9".to_string()),
        payload: json!({ "name": "Ada" }),
    };
    assert!(h.engine.trigger(&event).await.unwrap().is_empty());

    let manual = h.engine.trigger_manual(&workflow.id, None, None, None).await;
    assert!(matches!(manual, Err(EngineError::WorkflowInactive(_))));

    let stats = h.engine.get_stats(COMPANY).await.unwrap();
    assert_eq!(stats.total_workflows, 1);
    assert_eq!(stats.active_workflows, 0);
    assert_eq!(stats.total_executions, 0);

    // Activating makes the same event start an execution
    h.engine.workflows().set_active(&workflow.id, true).await.unwrap();
    assert_eq!(h.engine.trigger(&event).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_event_trigger_filters_by_config_and_company() {
    let h = harness().await;
    let mut new = manual_workflow("Qualified lead");
    new.trigger_type = TriggerType::LeadStageChange;
    new.trigger_config = json!({ "to_stage": "qualified" }).as_object().cloned().unwrap();
    create(&h, new, vec![StepDraft::new(email("Next steps"))]).await;

    let event = |company: &str, stage: &str| TriggerEvent {
        company_id: company.to_string(),
        trigger_type: TriggerType::LeadStageChange,
        entity_type: Some("lead".to_string()),
        entity_id: Some("lead-1".to_string()),
        payload: json!({ "old_stage": "new", "new_stage": stage }),
    };

    let started = h.engine.trigger(&event(COMPANY, "Qualified")).await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].trigger_type, TriggerType::LeadStageChange);
    assert_eq!(started[0].trigger_data["new_stage"], "Qualified");

    assert!(h.engine.trigger(&event(COMPANY, "lost")).await.unwrap().is_empty());
    assert!(h.engine.trigger(&event("company-2", "qualified")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_linear_steps_run_in_step_order() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Linear"),
        vec![StepDraft::new(email("first")), StepDraft::new(notification("third"))],
    )
    .await;

    // Inserted between the two existing steps
    let mut middle = NewStep::new(sms("second"));
    middle.insert_after = Some(steps[0].id.clone());
    h.engine.workflows().add_step(&workflow.id, middle).await.unwrap();

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    let order: Vec<StepType> = h.collaborators.calls().iter().map(|call| call.step_type).collect();
    assert_eq!(
        order,
        vec![StepType::SendEmail, StepType::SendSms, StepType::CreateNotification]
    );

    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    let visited: Vec<i64> = detail
        .logs
        .iter()
        .filter(|log| log.outcome == LogOutcome::Succeeded)
        .filter_map(|log| log.step_order)
        .collect();
    assert_eq!(visited, vec![0, 1, 2]);
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_null_true_target_completes() {
    let h = harness().await;
    let (workflow, _) = create(
        &h,
        manual_workflow("VIP check"),
        vec![
            StepDraft::new(condition(ConditionScope::TriggerField, "vip", json!(true)))
                .branches(None, Some(1)),
            StepDraft::new(sms("not a vip")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, Some(json!({ "vip": true })), now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    let stored = h.engine.executions().require_execution(&execution.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert!(stored.error.is_none());
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 0);
}

#[tokio::test]
async fn test_deleted_branch_target_falls_through_to_completion() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Branching"),
        vec![
            StepDraft::new(condition(ConditionScope::TriggerField, "paid", json!(true)))
                .branches(Some(1), Some(2)),
            StepDraft::new(sms("thanks")),
            StepDraft::new(task("chase payment")),
        ],
    )
    .await;

    h.engine.workflows().delete_step(&steps[1].id).await.unwrap();
    let condition_step = h.engine.workflows().get_step(&steps[0].id).await.unwrap().unwrap();
    assert_eq!(condition_step.on_true_step_id, None);
    assert_eq!(condition_step.on_false_step_id.as_deref(), Some(steps[2].id.as_str()));

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, Some(json!({ "paid": true })), now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
    assert!(h.collaborators.calls().is_empty());
}

#[tokio::test]
async fn test_wait_never_resumes_early() {
    let h = harness().await;
    let (workflow, _) = create(
        &h,
        manual_workflow("Wait an hour"),
        vec![
            StepDraft::new(wait(60, WaitUnit::Minutes)),
            StepDraft::new(email("an hour later")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    let resume = h
        .engine
        .queue()
        .jobs_for_execution(&execution.id)
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.kind == JobKind::Resume)
        .unwrap();
    assert!(resume.run_at >= now + ChronoDuration::minutes(60));

    assert_eq!(h.engine.run_due_jobs(now + ChronoDuration::minutes(59)).await.unwrap(), 0);
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);

    h.engine
        .run_due_jobs(now + ChronoDuration::minutes(61))
        .await
        .unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 1);
}

#[tokio::test]
async fn test_wait_as_last_step_completes_after_resume() {
    let h = harness().await;
    let (workflow, _) = create(
        &h,
        manual_workflow("Trailing wait"),
        vec![StepDraft::new(email("now")), StepDraft::new(wait(1, WaitUnit::Hours))],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    h.engine.run_due_jobs(now + ChronoDuration::hours(2)).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_cancel_waiting_execution_blocks_resume() {
    let h = harness().await;
    let (workflow, _) = create(
        &h,
        manual_workflow("Cancelled"),
        vec![
            StepDraft::new(wait(1, WaitUnit::Hours)),
            StepDraft::new(email("never")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    assert!(h.engine.cancel_execution(&execution.id).await.unwrap());
    assert_eq!(h.engine.run_due_jobs(now + ChronoDuration::hours(2)).await.unwrap(), 0);

    let stored = h.engine.executions().require_execution(&execution.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert!(stored.completed_at.is_some());
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);

    // Cancelling a finished execution reports false
    assert!(!h.engine.cancel_execution(&execution.id).await.unwrap());
    assert!(matches!(
        h.engine.cancel_execution("missing").await,
        Err(EngineError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicate_jobs_have_single_side_effect() {
    let h = harness().await;
    let (workflow, _) = create(
        &h,
        manual_workflow("Once"),
        vec![StepDraft::new(email("once")), StepDraft::new(wait(1, WaitUnit::Hours))],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine
        .queue()
        .enqueue(&NewJob {
            execution_id: execution.id.clone(),
            workflow_id: workflow.id.clone(),
            kind: JobKind::Advance,
            step_index: 0,
            run_at: now,
        })
        .await
        .unwrap();

    // The second job finds the execution already past step 0 and is discarded
    assert_eq!(h.engine.run_due_jobs(now).await.unwrap(), 2);
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 1);
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);
}

#[tokio::test]
async fn test_reorder_missing_step_is_rejected() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Reorder"),
        vec![
            StepDraft::new(email("a")),
            StepDraft::new(sms("b")),
            StepDraft::new(task("c")),
        ],
    )
    .await;

    let partial = vec![steps[2].id.clone(), steps[0].id.clone()];
    let result = h.engine.workflows().reorder_steps(&workflow.id, &partial).await;
    assert!(matches!(result, Err(EngineError::InvalidReorder(_))));

    let after = h.engine.workflows().list_steps(&workflow.id).await.unwrap();
    let orders: Vec<(String, i64)> = after.iter().map(|s| (s.id.clone(), s.step_order)).collect();
    let before: Vec<(String, i64)> = steps.iter().map(|s| (s.id.clone(), s.step_order)).collect();
    assert_eq!(orders, before);
}

#[tokio::test]
async fn test_exhausted_retries_fail_execution() {
    let h = harness().await;
    h.collaborators.fail_always(StepType::SendSms);
    let (workflow, steps) = create(
        &h,
        manual_workflow("Broken SMS"),
        vec![StepDraft::new(email("ok")), StepDraft::new(sms("down"))],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Running);

    h.engine.run_due_jobs(now + ChronoDuration::seconds(10)).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Running);
    h.engine.run_due_jobs(now + ChronoDuration::seconds(20)).await.unwrap();

    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Failed);
    assert!(detail.execution.error.as_deref().unwrap_or_default().contains("send_sms"));
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 1);

    let retries = detail
        .logs
        .iter()
        .filter(|log| log.outcome == LogOutcome::Retrying)
        .count();
    assert_eq!(retries, 2);
    let failure = detail.logs.last().unwrap();
    assert_eq!(failure.outcome, LogOutcome::Failed);
    assert_eq!(failure.level, LogLevel::Error);
    assert_eq!(failure.step_id.as_deref(), Some(steps[1].id.as_str()));

    let jobs = h.engine.queue().jobs_for_execution(&execution.id).await.unwrap();
    assert!(jobs.iter().any(|job| job.status == "dead" && job.attempts == 3));

    // Failed executions are not retried as a whole
    assert_eq!(h.engine.run_due_jobs(now + ChronoDuration::hours(1)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = harness().await;
    h.collaborators.fail_times(StepType::SendEmail, 1);
    let (workflow, _) = create(&h, manual_workflow("Flaky"), vec![StepDraft::new(email("retry me"))]).await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);

    h.engine.run_due_jobs(now + ChronoDuration::seconds(5)).await.unwrap();
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 1);
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_timed_out_job_is_retried() {
    let worker = WorkerConfig {
        job_timeout_secs: 1,
        ..WorkerConfig::default()
    };
    let h = harness_with(worker, RetryPolicy::fixed(Duration::from_secs(1), 3)).await;
    h.collaborators.set_latency(StepType::SendEmail, Duration::from_secs(3));
    let (workflow, _) = create(&h, manual_workflow("Slow"), vec![StepDraft::new(email("slow"))]).await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Running);
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);

    h.collaborators.set_latency(StepType::SendEmail, Duration::ZERO);
    h.engine.run_due_jobs(now + ChronoDuration::minutes(1)).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 1);
}

#[tokio::test]
async fn test_zero_step_workflow_completes_immediately() {
    let h = harness().await;
    let (workflow, _) = create(&h, manual_workflow("Empty"), Vec::new()).await;

    let execution = h.engine.trigger_manual(&workflow.id, None, None, None).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.completed_at.is_some());
    assert!(h.engine.queue().jobs_for_execution(&execution.id).await.unwrap().is_empty());
    assert!(h.collaborators.calls().is_empty());
}

#[tokio::test]
async fn test_scheduled_workflow_fires_on_matching_tick() {
    let h = harness().await;
    let mut new = manual_workflow("Morning digest");
    new.trigger_type = TriggerType::Scheduled;
    new.cron_expression = Some("0 9 * * *".to_string());
    new.timezone = Some("Europe/Warsaw".to_string());
    let (workflow, _) = create(&h, new, vec![StepDraft::new(email("digest"))]).await;

    // 09:00 in Warsaw during summer time
    let tick = Utc.with_ymd_and_hms(2026, 6, 15, 7, 0, 0).unwrap();
    let started = h.engine.on_tick(tick).await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].workflow_id, workflow.id);
    assert_eq!(started[0].trigger_type, TriggerType::Scheduled);
    assert_eq!(started[0].trigger_data["timezone"], "Europe/Warsaw");

    assert!(h.engine.on_tick(tick + ChronoDuration::minutes(1)).await.unwrap().is_empty());

    h.engine.workflows().set_active(&workflow.id, false).await.unwrap();
    assert!(h.engine.on_tick(tick + ChronoDuration::days(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_step_is_skipped() {
    let h = harness().await;
    let mut disabled = StepDraft::new(email("skipped"));
    disabled.is_active = false;
    let (workflow, _) = create(
        &h,
        manual_workflow("Skip"),
        vec![disabled, StepDraft::new(sms("sent"))],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 1);
    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert!(detail.logs.iter().any(|log| log.outcome == LogOutcome::Skipped));
}

#[tokio::test]
async fn test_condition_read_failure_takes_false_branch() {
    let h = harness().await;
    h.collaborators.fail_entity_reads(true);
    let (workflow, _) = create(
        &h,
        manual_workflow("Unreadable"),
        vec![
            StepDraft::new(condition(ConditionScope::EntityField, "rsvp_status", json!("confirmed")))
                .branches(Some(1), Some(2)),
            StepDraft::new(sms("thanks")),
            StepDraft::new(task("follow up")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(
            &workflow.id,
            Some("client".to_string()),
            Some("client-7".to_string()),
            None,
            now,
        )
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    assert_eq!(h.collaborators.call_count(StepType::SendSms), 0);
    assert_eq!(h.collaborators.call_count(StepType::CreateTask), 1);
    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert!(detail
        .logs
        .iter()
        .any(|log| log.outcome == LogOutcome::Branched && log.level == LogLevel::Warn));
}

#[tokio::test]
async fn test_step_budget_hands_off_to_new_jobs() {
    let worker = WorkerConfig {
        step_budget: 2,
        ..WorkerConfig::default()
    };
    let h = harness_with(worker, RetryPolicy::fixed(Duration::from_secs(1), 3)).await;
    let steps = (0..5).map(|i| StepDraft::new(email(&format!("email {}", i)))).collect();
    let (workflow, _) = create(&h, manual_workflow("Long"), steps).await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();

    assert_eq!(h.engine.run_due_jobs(now).await.unwrap(), 3);
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 5);
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_stats_and_history() {
    let h = harness().await;
    let (workflow, _) = create(
        &h,
        manual_workflow("Stats"),
        vec![StepDraft::new(wait(1, WaitUnit::Days))],
    )
    .await;

    let now = Utc::now();
    let first = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    let second = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now + ChronoDuration::seconds(1))
        .await
        .unwrap();
    h.engine.run_due_jobs(now + ChronoDuration::seconds(1)).await.unwrap();
    h.engine.cancel_execution(&first.id).await.unwrap();

    let stats = h.engine.get_stats(COMPANY).await.unwrap();
    assert_eq!(stats.total_workflows, 1);
    assert_eq!(stats.active_workflows, 1);
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.executions_by_status["cancelled"], 1);
    assert_eq!(stats.executions_by_status["waiting"], 1);
    assert_eq!(stats.executions_by_status["failed"], 0);

    let history = h.engine.list_executions(&workflow.id, None, 10).await.unwrap();
    let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

    let waiting = h
        .engine
        .list_executions(&workflow.id, Some(ExecutionStatus::Waiting), 10)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, second.id);
}

#[tokio::test]
async fn test_executions_survive_workflow_deletion() {
    let h = harness().await;
    let (workflow, _) = create(&h, manual_workflow("Short lived"), vec![StepDraft::new(email("hi"))]).await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    assert!(h.engine.workflows().delete_workflow(&workflow.id).await.unwrap());
    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert!(!detail.logs.is_empty());
}

#[tokio::test]
async fn test_out_of_range_wait_fails_the_step_instead_of_the_worker() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Long wait"),
        vec![StepDraft::new(wait(1, WaitUnit::Days)), StepDraft::new(email("someday"))],
    )
    .await;

    let rejected = h
        .engine
        .workflows()
        .add_step(&workflow.id, NewStep::new(wait(100_000_000, WaitUnit::Days)))
        .await;
    assert!(matches!(rejected, Err(EngineError::InvalidDefinition(_))));

    // A row written around validation still must not take the worker down
    sqlx::query("UPDATE workflow_steps SET config = ? WHERE id = ?")
        .bind(json!({ "type": "wait", "duration": 100_000_000u32, "unit": "days" }).to_string())
        .bind(&steps[0].id)
        .execute(h.engine.workflows().pool())
        .await
        .unwrap();

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Running);
    h.engine.run_due_jobs(now + ChronoDuration::seconds(10)).await.unwrap();
    h.engine.run_due_jobs(now + ChronoDuration::seconds(20)).await.unwrap();

    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Failed);
    assert!(detail.execution.error.as_deref().unwrap_or_default().contains("out of range"));
    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);
}

#[tokio::test]
async fn test_disabled_condition_passes_through_to_following_steps() {
    let h = harness().await;
    let mut disabled = StepDraft::new(condition(ConditionScope::TriggerField, "vip", json!(true)))
        .branches(Some(1), Some(2));
    disabled.is_active = false;
    let (workflow, _) = create(
        &h,
        manual_workflow("Paused branch"),
        vec![
            disabled,
            StepDraft::new(sms("vip")),
            StepDraft::new(task("regular")),
            StepDraft::new(notification("done")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, Some(json!({ "vip": true })), now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    let order: Vec<StepType> = h.collaborators.calls().iter().map(|call| call.step_type).collect();
    assert_eq!(
        order,
        vec![StepType::SendSms, StepType::CreateTask, StepType::CreateNotification]
    );
    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert!(!detail.logs.iter().any(|log| log.outcome == LogOutcome::Branched));
    assert!(detail.logs.iter().any(|log| log.outcome == LogOutcome::Skipped));
}

#[tokio::test]
async fn test_deleting_a_finished_step_keeps_waiting_execution_on_track() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Drip"),
        vec![
            StepDraft::new(email("intro")),
            StepDraft::new(wait(1, WaitUnit::Hours)),
            StepDraft::new(sms("follow up")),
            StepDraft::new(task("call")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    h.engine.workflows().delete_step(&steps[0].id).await.unwrap();
    h.engine.run_due_jobs(now + ChronoDuration::hours(2)).await.unwrap();

    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 1);
    assert_eq!(h.collaborators.call_count(StepType::CreateTask), 1);
}

#[tokio::test]
async fn test_queued_job_for_deleted_step_continues_with_next_step() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Trimmed"),
        vec![
            StepDraft::new(email("removed")),
            StepDraft::new(sms("kept")),
            StepDraft::new(task("kept too")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.workflows().delete_step(&steps[0].id).await.unwrap();
    h.engine.run_due_jobs(now).await.unwrap();

    assert_eq!(h.collaborators.call_count(StepType::SendEmail), 0);
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 1);
    assert_eq!(h.collaborators.call_count(StepType::CreateTask), 1);
    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert!(detail
        .logs
        .iter()
        .any(|log| log.outcome == LogOutcome::Skipped && log.step_order == Some(0)));
}

#[tokio::test]
async fn test_insert_before_waiting_position_does_not_rerun_steps() {
    let h = harness().await;
    let (workflow, steps) = create(
        &h,
        manual_workflow("Drip"),
        vec![
            StepDraft::new(email("intro")),
            StepDraft::new(wait(1, WaitUnit::Hours)),
            StepDraft::new(sms("follow up")),
        ],
    )
    .await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();
    h.engine.run_due_jobs(now).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Waiting);

    let mut inserted = NewStep::new(notification("added later"));
    inserted.insert_after = Some(steps[0].id.clone());
    h.engine.workflows().add_step(&workflow.id, inserted).await.unwrap();

    let moved = h.engine.executions().require_execution(&execution.id).await.unwrap();
    assert_eq!(moved.current_step_index, 2);

    h.engine.run_due_jobs(now + ChronoDuration::hours(2)).await.unwrap();
    assert_eq!(status_of(&h, &execution.id).await, ExecutionStatus::Completed);
    assert_eq!(h.collaborators.call_count(StepType::CreateNotification), 0);
    assert_eq!(h.collaborators.call_count(StepType::SendSms), 1);
    let waits = h
        .engine
        .get_execution_detail(&execution.id)
        .await
        .unwrap()
        .logs
        .iter()
        .filter(|log| log.outcome == LogOutcome::Waiting)
        .count();
    assert_eq!(waits, 1);
}

#[tokio::test]
async fn test_one_failing_start_does_not_block_other_workflows() {
    let h = harness().await;
    let mut broken = manual_workflow("Broken");
    broken.trigger_type = TriggerType::ClientCreated;
    let (broken, _) = create(&h, broken, vec![StepDraft::new(email("never"))]).await;
    let mut healthy = manual_workflow("Healthy");
    healthy.trigger_type = TriggerType::ClientCreated;
    let (healthy, _) = create(&h, healthy, vec![StepDraft::new(email("welcome"))]).await;

    // Reject every execution insert for the first workflow
    sqlx::query(&format!(
        "CREATE TRIGGER reject_broken BEFORE INSERT ON workflow_executions \
         WHEN NEW.workflow_id = '{}' BEGIN SELECT RAISE(ABORT, 'storage rejected'); END",
        broken.id
    ))
    .execute(h.engine.workflows().pool())
    .await
    .unwrap();

    let event = TriggerEvent {
        company_id: COMPANY.to_string(),
        trigger_type: TriggerType::ClientCreated,
        entity_type: Some("client".to_string()),
        entity_id: Some("client-1".to_string()),
        payload: json!({}),
    };
    let started = h.engine.trigger(&event).await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].workflow_id, healthy.id);
}

#[tokio::test]
async fn test_failure_after_cancel_leaves_audit_trail_closed() {
    let h = harness().await;
    h.collaborators.fail_always(StepType::SendEmail);
    h.collaborators.set_latency(StepType::SendEmail, Duration::from_millis(300));
    let (workflow, _) = create(&h, manual_workflow("Doomed"), vec![StepDraft::new(email("down"))]).await;

    let now = Utc::now();
    let execution = h
        .engine
        .trigger_manual_at(&workflow.id, None, None, None, now)
        .await
        .unwrap();

    let scheduler = h.engine.scheduler();
    let running = tokio::spawn(async move { scheduler.run_due_jobs(now).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.engine.cancel_execution(&execution.id).await.unwrap());
    running.await.unwrap().unwrap();

    let detail = h.engine.get_execution_detail(&execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(detail.logs.last().unwrap().outcome, LogOutcome::Cancelled);
    assert!(!detail.logs.iter().any(|log| log.outcome == LogOutcome::Retrying));

    let jobs = h.engine.queue().jobs_for_execution(&execution.id).await.unwrap();
    assert!(jobs.iter().all(|job| job.status != "pending"));
    assert_eq!(h.engine.run_due_jobs(now + ChronoDuration::minutes(5)).await.unwrap(), 0);
}
