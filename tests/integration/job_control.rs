//! Pause, resume, and stop against running jobs.

use crate::integration::test_utils::{settings, sim, Harness};
use crmsim::error::SimError;
use crmsim::scheduler::ManagerSettings;
use crmsim::types::{JobStatus, StepStatus};

fn one_worker() -> ManagerSettings {
    let mut settings = settings();
    settings.scheduler.workers = 1;
    settings.plan.association_rules.clear();
    settings
}

#[tokio::test]
async fn stop_lets_the_in_flight_call_finish_and_skips_the_rest() {
    let h = Harness::new(one_worker());
    h.stub.hold_call(10);
    let id = h.manager.start_job("alice", sim(50, 0, 0, 0, 0)).unwrap();

    h.stub.wait_until_held().await;
    assert_eq!(h.manager.stop_job(&id).unwrap(), JobStatus::Stopped);
    h.stub.release_held();

    let report = h.manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Stopped);
    assert_eq!(report.steps_succeeded, 10);
    assert_eq!(report.steps_skipped, 40);
    assert_eq!(report.steps_pending, 0);
    assert_eq!(report.steps_in_flight, 0);
    assert_eq!(h.stub.call_count(), 10);
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let h = Harness::new(one_worker());
    h.stub.hold_call(1);
    let id = h.manager.start_job("alice", sim(3, 0, 0, 0, 0)).unwrap();
    h.stub.wait_until_held().await;

    assert_eq!(h.manager.stop_job(&id).unwrap(), JobStatus::Stopped);
    assert_eq!(h.manager.stop_job(&id).unwrap(), JobStatus::Stopped);
    assert!(matches!(
        h.manager.pause_job(&id),
        Err(SimError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.manager.resume_job(&id),
        Err(SimError::InvalidTransition { .. })
    ));

    h.stub.release_held();
    let report = h.manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Stopped);
    assert_eq!(h.stub.call_count(), 1);
}

#[tokio::test]
async fn paused_job_dispatches_nothing_until_resumed() {
    let h = Harness::new(one_worker());
    h.stub.hold_call(2);
    let id = h.manager.start_job("alice", sim(5, 0, 0, 0, 0)).unwrap();
    h.stub.wait_until_held().await;

    assert_eq!(h.manager.pause_job(&id).unwrap(), JobStatus::Paused);
    assert_eq!(h.manager.pause_job(&id).unwrap(), JobStatus::Paused);
    h.stub.release_held();

    let paused = h
        .manager
        .wait_until(&id, |r| r.steps_in_flight == 0)
        .await
        .unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.steps_succeeded, 2);
    assert_eq!(paused.steps_pending, 3);
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.stub.call_count(), 2);

    assert_eq!(h.manager.resume_job(&id).unwrap(), JobStatus::Running);
    let report = h.manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_succeeded, 5);
    assert_eq!(h.stub.call_count(), 5);

    let events = h.manager.events(&id, 0).unwrap();
    assert!(events.iter().any(|e| e.event_type == "job_paused"));
    assert!(events.iter().any(|e| e.event_type == "job_resumed"));
}

#[tokio::test]
async fn stopping_a_job_known_only_to_the_store() {
    let h = Harness::new(one_worker());
    h.stub.hold_call(2);
    let id = h.manager.start_job("alice", sim(4, 0, 0, 0, 0)).unwrap();
    h.stub.wait_until_held().await;
    h.manager.pause_job(&id).unwrap();
    h.stub.release_held();
    h.manager
        .wait_until(&id, |r| r.steps_in_flight == 0)
        .await
        .unwrap();
    h.manager.shutdown().await;

    let other = h.restarted(one_worker());
    assert_eq!(other.stop_job(&id).unwrap(), JobStatus::Stopped);
    let report = other.get_status(&id).unwrap();
    assert_eq!(report.steps_succeeded, 2);
    assert_eq!(report.steps_skipped, 2);

    let steps = h.store_steps(&id);
    assert!(steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped)));
}
