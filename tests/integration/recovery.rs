//! Restart recovery from persisted progress.

use crate::integration::test_utils::{settings, sim, Harness};
use crmsim::crm::CrmCall;
use crmsim::error::SimError;
use crmsim::plan::Plan;
use crmsim::store::{JobRecord, ProgressStore, SledProgressStore};
use crmsim::types::{now_millis, JobId, JobStatus, RecordId, RecordType, StepStatus};

/// Persist `plan` as a job that was running when the process died: contacts
/// and companies created, the deal create in flight.
fn persist_interrupted(h: &Harness, job_id: &JobId, plan: &Plan, digest: String) {
    let now = now_millis();
    let mut steps = plan.steps.clone();
    for step in steps.iter_mut() {
        match (step.creates().cloned(), step.record_type()) {
            (Some(placeholder), RecordType::Contact | RecordType::Company) => {
                step.status = StepStatus::Succeeded;
                step.attempts = 1;
                step.real_id = Some(RecordId::new(format!("persisted-{}", placeholder)));
            }
            (Some(_), RecordType::Deal) => {
                step.status = StepStatus::InFlight;
                step.attempts = 1;
            }
            _ => {}
        }
    }
    h.store.put_steps(job_id, &steps).unwrap();
    h.store
        .put_job(&JobRecord {
            job_id: job_id.clone(),
            owner: "alice".to_string(),
            config: sim(1, 1, 1, 0, 0),
            status: JobStatus::Running,
            created_at_ms: now,
            started_at_ms: Some(now),
            completed_at_ms: None,
            plan_digest: digest,
            duration_ms: plan.duration_ms,
            steps_total: steps.len(),
            error: None,
            updated_at_ms: now,
        })
        .unwrap();
}

#[tokio::test]
async fn interrupted_job_resumes_with_persisted_ids() {
    let h = Harness::new(settings());
    let plan = h.manager.plan(&sim(1, 1, 1, 0, 0)).unwrap();
    let job_id = JobId::from("job-interrupted");
    persist_interrupted(&h, &job_id, &plan, plan.digest());

    let manager = h.restarted(settings());
    let report = manager.recover().unwrap();
    assert_eq!(report.recovered, vec![job_id.clone()]);
    assert!(report.rejected.is_empty());

    let status = manager.get_status(&job_id).unwrap();
    assert_eq!(status.status, JobStatus::Paused);
    assert_eq!(status.steps_in_flight, 0);
    assert_eq!(status.steps_succeeded, 2);

    let events = manager.events(&job_id, 0).unwrap();
    assert_eq!(events.last().unwrap().event_type, "job_paused");
    assert_eq!(events.last().unwrap().data["reason"], "interrupted");

    assert_eq!(manager.resume_job(&job_id).unwrap(), JobStatus::Running);
    let done = manager.wait(&job_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.steps_succeeded, done.steps_total);

    // Only the deal is created again; the association uses the stored ids.
    let calls = h.stub.calls();
    let creates: Vec<_> = calls
        .iter()
        .filter_map(|c| match &c.call {
            CrmCall::Create { record_type, .. } => Some(*record_type),
            _ => None,
        })
        .collect();
    assert_eq!(creates, vec![RecordType::Deal]);
    let targets: Vec<String> = calls
        .iter()
        .filter_map(|c| match &c.call {
            CrmCall::Associate(request) => Some(request),
            _ => None,
        })
        .flat_map(|r| r.inputs.iter().map(|i| i.to_id.to_string()))
        .collect();
    assert!(!targets.is_empty());
    assert!(targets.iter().all(|id| id.starts_with("persisted-")));
}

#[tokio::test]
async fn tampered_plan_is_rejected() {
    let h = Harness::new(settings());
    let plan = h.manager.plan(&sim(1, 1, 1, 0, 0)).unwrap();
    let job_id = JobId::from("job-tampered");
    let mut tampered = plan.clone();
    tampered.steps[0].offset_ms += 1;
    persist_interrupted(&h, &job_id, &tampered, plan.digest());

    let manager = h.restarted(settings());
    let report = manager.recover().unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, job_id);

    assert!(matches!(
        manager.resume_job(&job_id),
        Err(SimError::PlanIntegrity(_))
    ));
    assert_eq!(h.stub.call_count(), 0);
}

#[tokio::test]
async fn terminal_jobs_are_left_alone() {
    let h = Harness::new(settings());
    let id = h.manager.start_job("alice", sim(2, 0, 0, 0, 0)).unwrap();
    h.manager.wait(&id).await.unwrap();
    h.manager.shutdown().await;

    let manager = h.restarted(settings());
    let report = manager.recover().unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(
        manager.get_status(&id).unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn never_started_job_must_be_started_before_stopping() {
    let h = Harness::new(settings());
    let plan = h.manager.plan(&sim(2, 0, 0, 0, 0)).unwrap();
    let job_id = JobId::from("job-never-started");
    let now = now_millis();
    h.store.put_steps(&job_id, &plan.steps).unwrap();
    h.store
        .put_job(&JobRecord {
            job_id: job_id.clone(),
            owner: "alice".to_string(),
            config: sim(2, 0, 0, 0, 0),
            status: JobStatus::Pending,
            created_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
            plan_digest: plan.digest(),
            duration_ms: plan.duration_ms,
            steps_total: plan.steps.len(),
            error: None,
            updated_at_ms: now,
        })
        .unwrap();

    let manager = h.restarted(settings());
    let err = manager.stop_job(&job_id).unwrap_err();
    assert!(matches!(
        err,
        SimError::InvalidTransition { from: JobStatus::Pending, action: "stop", .. }
    ));
    assert_eq!(manager.get_status(&job_id).unwrap().status, JobStatus::Pending);
    assert_eq!(h.stub.call_count(), 0);

    assert_eq!(manager.resume_job(&job_id).unwrap(), JobStatus::Running);
    assert_eq!(manager.stop_job(&job_id).unwrap(), JobStatus::Stopped);
}

#[test]
fn progress_survives_reopening_the_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("store");
    let job_id = JobId::from("job-reopen");
    {
        let store = SledProgressStore::open(&path).unwrap();
        store
            .append_event(&job_id, "job_created", serde_json::json!({}))
            .unwrap();
        store
            .append_event(&job_id, "job_started", serde_json::json!({}))
            .unwrap();
        store.flush().unwrap();
    }
    let store = SledProgressStore::open(&path).unwrap();
    let next = store
        .append_event(&job_id, "job_paused", serde_json::json!({}))
        .unwrap();
    assert_eq!(next.seq, 3);
    let types: Vec<String> = store
        .read_events(&job_id, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["job_created", "job_started", "job_paused"]);
}
