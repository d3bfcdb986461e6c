//! Rate budget pacing across jobs, on tokio's paused clock.

use crate::integration::test_utils::{settings, sim, Harness};
use async_trait::async_trait;
use crmsim::crm::{AssociationRequest, CrmClient, CrmError, FieldMap, RecordUpdate};
use crmsim::executor::{BudgetScope, Executor, Operation, RateBudget, RetryPolicy};
use crmsim::scheduler::ManagerSettings;
use crmsim::types::{JobStatus, RecordId, RecordType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// CRM that records when each create reached it.
#[derive(Default)]
struct TimedCrm {
    sent: Mutex<Vec<Instant>>,
}

#[async_trait]
impl CrmClient for TimedCrm {
    async fn create_record(
        &self,
        _record_type: RecordType,
        _fields: &FieldMap,
    ) -> Result<RecordId, CrmError> {
        let mut sent = self.sent.lock();
        sent.push(Instant::now());
        Ok(RecordId::new(sent.len().to_string()))
    }

    async fn create_associations(&self, request: &AssociationRequest) -> Result<usize, CrmError> {
        Ok(request.inputs.len())
    }

    async fn update_records(
        &self,
        _record_type: RecordType,
        updates: &[RecordUpdate],
    ) -> Result<usize, CrmError> {
        Ok(updates.len())
    }
}

fn budgeted(scope: BudgetScope) -> ManagerSettings {
    let mut settings = settings();
    settings.plan.association_rules.clear();
    settings.rate_limit.ceiling = 3;
    settings.rate_limit.window_ms = 1_000;
    settings.rate_limit.scope = scope;
    settings
}

#[tokio::test(start_paused = true)]
async fn calls_beyond_the_ceiling_wait_for_the_next_window() {
    let h = Harness::new(budgeted(BudgetScope::Credential));
    let started = Instant::now();
    let id = h.manager.start_job("alice", sim(7, 0, 0, 0, 0)).unwrap();
    let report = h.manager.wait(&id).await.unwrap();

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_succeeded, 7);
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert!(started.elapsed() < Duration::from_millis(3_000));
}

#[tokio::test(start_paused = true)]
async fn jobs_on_one_credential_share_a_budget() {
    let h = Harness::new(budgeted(BudgetScope::Credential));
    let started = Instant::now();
    let a = h.manager.start_job("alice", sim(3, 0, 0, 0, 0)).unwrap();
    let b = h.manager.start_job("bob", sim(3, 0, 0, 0, 0)).unwrap();
    h.manager.wait(&a).await.unwrap();
    h.manager.wait(&b).await.unwrap();

    assert_eq!(h.stub.call_count(), 6);
    assert!(started.elapsed() >= Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn job_scoped_budgets_are_independent() {
    let h = Harness::new(budgeted(BudgetScope::Job));
    let started = Instant::now();
    let a = h.manager.start_job("alice", sim(3, 0, 0, 0, 0)).unwrap();
    let b = h.manager.start_job("bob", sim(3, 0, 0, 0, 0)).unwrap();
    h.manager.wait(&a).await.unwrap();
    h.manager.wait(&b).await.unwrap();

    assert_eq!(h.stub.call_count(), 6);
    assert!(started.elapsed() < Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn concurrent_executions_never_exceed_the_ceiling() {
    let window = Duration::from_secs(1);
    let crm = Arc::new(TimedCrm::default());
    let budget = Arc::new(RateBudget::new(window, 3));
    let executor = Arc::new(Executor::new(crm.clone(), budget, RetryPolicy::default()));

    let mut tasks = JoinSet::new();
    for _ in 0..40 {
        let executor = Arc::clone(&executor);
        tasks.spawn(async move {
            let operation = Operation::Create {
                record_type: RecordType::Contact,
                fields: FieldMap::new(),
            };
            executor
                .execute(&operation, &CancellationToken::new(), |_| {})
                .await
        });
    }
    while let Some(done) = tasks.join_next().await {
        assert!(done.unwrap().is_ok());
    }

    let sent = crm.sent.lock().clone();
    assert_eq!(sent.len(), 40);
    for start in &sent {
        let in_window = sent
            .iter()
            .filter(|t| **t >= *start && **t < *start + window)
            .count();
        assert!(in_window <= 3, "{} calls within one window", in_window);
    }
    let first = sent.iter().min().copied().unwrap();
    let last = sent.iter().max().copied().unwrap();
    assert!(last.duration_since(first) >= Duration::from_secs(13));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grants_from_many_threads_respect_each_window() {
    let budget = Arc::new(RateBudget::new(Duration::from_millis(20), 5));
    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let budget = Arc::clone(&budget);
        tasks.spawn(async move {
            let cancel = CancellationToken::new();
            let mut grants = Vec::new();
            for _ in 0..5 {
                grants.push(budget.acquire(&cancel).await.unwrap());
            }
            grants
        });
    }
    let mut windows: HashMap<Instant, Vec<u32>> = HashMap::new();
    while let Some(done) = tasks.join_next().await {
        for grant in done.unwrap() {
            windows.entry(grant.window_start).or_default().push(grant.ordinal);
        }
    }

    assert_eq!(windows.values().map(Vec::len).sum::<usize>(), 80);
    for ordinals in windows.values_mut() {
        assert!(ordinals.len() <= 5);
        ordinals.sort_unstable();
        let expected: Vec<u32> = (1..=ordinals.len() as u32).collect();
        assert_eq!(*ordinals, expected);
    }
}
