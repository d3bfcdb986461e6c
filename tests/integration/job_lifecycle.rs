//! End-to-end job runs against the in-memory CRM.

use crate::integration::test_utils::{settings, sim, Harness};
use crmsim::crm::stub::CrmCall;
use crmsim::crm::{CrmError, CrmErrorKind};
use crmsim::plan::StepKind;
use crmsim::types::{JobStatus, RecordType, StepStatus};
use std::collections::HashSet;

#[tokio::test]
async fn deal_links_to_contact_and_company_in_one_call() {
    let h = Harness::new(settings());
    let id = h.manager.start_job("alice", sim(2, 1, 1, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_total, 5);
    assert_eq!(report.steps_succeeded, 5);
    assert_eq!(h.stub.created_count(), 4);
    assert_eq!(h.stub.association_calls(), 1);

    let association = h
        .stub
        .calls()
        .into_iter()
        .find_map(|c| match c.call {
            CrmCall::Associate(request) => Some(request),
            _ => None,
        })
        .unwrap();
    assert_eq!(association.from_type, RecordType::Deal);
    let targets: HashSet<RecordType> = association.inputs.iter().map(|i| i.to_type).collect();
    assert_eq!(targets, HashSet::from([RecordType::Contact, RecordType::Company]));
}

#[tokio::test]
async fn associations_only_carry_ids_the_crm_returned() {
    let h = Harness::new(settings());
    let id = h.manager.start_job("alice", sim(3, 2, 4, 2, 3)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let mut created = HashSet::new();
    for call in h.stub.calls() {
        match call.call {
            CrmCall::Create { id: Some(id), .. } => {
                created.insert(id);
            }
            CrmCall::Associate(request) => {
                assert!(created.contains(&request.from_id));
                for input in &request.inputs {
                    assert!(created.contains(&input.to_id), "{} not created yet", input.to_id);
                }
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn unsupported_task_type_is_skipped_without_failing_the_job() {
    let h = Harness::new(settings());
    h.stub.fail_type(RecordType::Task, CrmErrorKind::UnknownObjectType);
    let mut config = sim(1, 0, 0, 0, 0);
    config
        .record_distribution
        .additional
        .insert("tasks".to_string(), 1);

    let id = h.manager.start_job("alice", config).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_succeeded, 1);
    assert_eq!(report.steps_skipped, 2);
    assert_eq!(report.steps_failed, 0);

    let steps = h.manager.steps(&id).unwrap();
    let link = steps
        .iter()
        .find(|s| matches!(s.kind, StepKind::Associate { .. }))
        .unwrap();
    assert_eq!(link.status, StepStatus::Skipped);
    assert!(link.last_error.as_deref().unwrap().contains("task:0"));
    assert_eq!(h.stub.association_calls(), 0);
}

#[tokio::test]
async fn validation_failure_skips_dependents_only() {
    let h = Harness::new(settings());
    h.stub.fail_type(RecordType::Company, CrmErrorKind::Validation);
    let id = h.manager.start_job("alice", sim(0, 1, 1, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_succeeded, 1);
    assert_eq!(report.steps_failed, 1);
    assert_eq!(report.steps_skipped, 1);
    assert_eq!(h.stub.association_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let h = Harness::new(settings());
    h.stub
        .fail_next(CrmError::from_status(429, "slow down", None));
    h.stub
        .fail_next(CrmError::from_status(503, "unavailable", None));

    let id = h.manager.start_job("alice", sim(1, 0, 0, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(h.stub.call_count(), 3);
    let steps = h.manager.steps(&id).unwrap();
    assert_eq!(steps[0].status, StepStatus::Succeeded);
    assert_eq!(steps[0].attempts, 3);

    let events = h.manager.events(&id, 0).unwrap();
    let retries = events
        .iter()
        .filter(|e| e.event_type == "step_retrying")
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test(start_paused = true)]
async fn retried_step_is_in_flight_while_the_retry_is_sent() {
    let h = Harness::new(settings());
    h.stub
        .fail_next(CrmError::from_status(503, "unavailable", None));
    h.stub.hold_call(2);

    let id = h.manager.start_job("alice", sim(1, 0, 0, 0, 0)).unwrap();
    h.stub.wait_until_held().await;

    let steps = h.manager.steps(&id).unwrap();
    assert_eq!(steps[0].status, StepStatus::InFlight);
    assert_eq!(steps[0].attempts, 2);
    let persisted = h.store_steps(&id);
    assert_eq!(persisted[0].status, StepStatus::InFlight);

    let types: Vec<String> = h
        .manager
        .events(&id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .filter(|t| t.starts_with("step_"))
        .collect();
    let retrying = types.iter().position(|t| t == "step_retrying").unwrap();
    let resent = types.iter().position(|t| t == "step_resent").unwrap();
    assert!(retrying < resent);

    h.stub.release_held();
    let report = h.manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(h.manager.steps(&id).unwrap()[0].status, StepStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_step() {
    let mut settings = settings();
    settings.retry.max_attempts = 2;
    let h = Harness::new(settings);
    h.stub.fail_type(RecordType::Contact, CrmErrorKind::Server);

    let id = h.manager.start_job("alice", sim(1, 0, 0, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_failed, 1);
    assert_eq!(h.stub.call_count(), 2);
}

#[tokio::test]
async fn authentication_failure_aborts_the_job() {
    let mut settings = settings();
    settings.scheduler.workers = 1;
    let h = Harness::new(settings);
    h.stub.fail_type(RecordType::Contact, CrmErrorKind::Authentication);

    let id = h.manager.start_job("alice", sim(3, 0, 0, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.steps_failed, 1);
    assert_eq!(report.steps_skipped, 2);
    assert!(report.error.is_some());
    assert_eq!(h.stub.call_count(), 1);
}

#[tokio::test]
async fn lifecycle_updates_touch_every_deal_once() {
    let mut settings = settings();
    settings.plan.lifecycle_updates = true;
    settings.plan.association_rules.clear();
    let h = Harness::new(settings);

    let id = h.manager.start_job("alice", sim(0, 0, 3, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);

    let mut updated = Vec::new();
    for call in h.stub.calls() {
        if let CrmCall::Update {
            record_type,
            updates,
        } = call.call
        {
            assert_eq!(record_type, RecordType::Deal);
            let ids: HashSet<_> = updates.iter().map(|u| u.id.clone()).collect();
            assert_eq!(ids.len(), updates.len());
            updated.extend(updates);
        }
    }
    assert_eq!(updated.len(), 3);
    assert!(updated
        .iter()
        .all(|u| u.fields.get("dealstage").and_then(|v| v.as_str()) == Some("closedwon")));
}

#[tokio::test]
async fn event_log_records_the_run_in_order() {
    let h = Harness::new(settings());
    let id = h.manager.start_job("alice", sim(2, 0, 0, 0, 0)).unwrap();
    h.manager.wait(&id).await.unwrap();

    let events = h.manager.events(&id, 0).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types.first(), Some(&"job_created"));
    assert_eq!(types.get(1), Some(&"job_started"));
    assert_eq!(types.last(), Some(&"job_completed"));
    assert_eq!(types.iter().filter(|t| **t == "step_succeeded").count(), 2);
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    let tail = h.manager.events(&id, events[1].seq).unwrap();
    assert_eq!(tail.len(), events.len() - 2);
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_anything_runs() {
    let h = Harness::new(settings());
    let mut config = sim(1, 0, 0, 0, 0);
    config
        .record_distribution
        .additional
        .insert("invoices".to_string(), 2);
    assert!(h.manager.start_job("alice", config).is_err());
    assert!(h.manager.list_jobs().unwrap().is_empty());
    assert_eq!(h.stub.call_count(), 0);
}
