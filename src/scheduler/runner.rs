//! The per-job dispatch loop.

use crate::crm::CrmErrorKind;
use crate::executor::{AttemptEvent, Dispatch, Execution, Executor, StepFailure};
use crate::scheduler::job::JobShared;
use crate::scheduler::SchedulerSettings;
use crate::types::JobStatus;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info};

type DispatchResult = (Vec<u32>, Result<Execution, StepFailure>);

/// Drive one job until it is terminal or its cancellation token fires.
///
/// At most `settings.workers` dispatches are in flight. The loop wakes on a
/// finished dispatch, a control transition, the next scheduled offset, or
/// cancellation.
pub(crate) async fn run_job(
    shared: Arc<JobShared>,
    executor: Arc<Executor>,
    settings: SchedulerSettings,
) {
    let job_id = shared.job_id().clone();
    let cancel = shared.cancel_token().clone();
    let mut tasks: JoinSet<DispatchResult> = JoinSet::new();
    info!(job_id = %job_id, workers = settings.workers, "Job runner started");

    loop {
        let status = shared.status();
        if status.is_terminal() || cancel.is_cancelled() {
            drain(&shared, &mut tasks, &settings.fatal_errors).await;
            break;
        }

        let mut next_due = None;
        if status == JobStatus::Running {
            shared.skip_unreachable();
            let capacity = settings.workers.saturating_sub(tasks.len());
            for dispatch in shared.take_ready(capacity, settings.max_batch_size) {
                spawn_dispatch(&mut tasks, &shared, &executor, dispatch);
            }

            if tasks.is_empty() {
                if shared.all_terminal() {
                    shared.finalize();
                    break;
                }
                next_due = shared.next_due_in();
                if next_due.is_none() && shared.has_pending() {
                    // Nothing in flight, nothing scheduled later, and nothing
                    // dispatchable now.
                    shared.fail_blocked();
                    continue;
                }
            } else {
                next_due = shared.next_due_in();
            }
        }

        let has_timer = next_due.is_some();
        let timer = sleep(next_due.unwrap_or(Duration::ZERO));
        tokio::select! {
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                apply(&shared, joined, &settings.fatal_errors);
            }
            _ = shared.wake.notified() => {}
            _ = timer, if has_timer => {}
            _ = cancel.cancelled() => {}
        }
    }

    debug!(job_id = %job_id, status = %shared.status(), "Job runner exiting");
    shared.set_runner_active(false);
}

fn spawn_dispatch(
    tasks: &mut JoinSet<DispatchResult>,
    shared: &Arc<JobShared>,
    executor: &Arc<Executor>,
    dispatch: Dispatch,
) {
    let shared = Arc::clone(shared);
    let executor = Arc::clone(executor);
    tasks.spawn(async move {
        let Dispatch { seqs, operation } = dispatch;
        let cancel = shared.cancel_token().clone();
        let outcome = AssertUnwindSafe(executor.execute(&operation, &cancel, |event| match event {
            AttemptEvent::Retrying { attempt, error } => {
                shared.mark_retrying(&seqs, attempt, error)
            }
            AttemptEvent::Resent { attempt } => shared.mark_resent(&seqs, attempt),
        }))
        .catch_unwind()
        .await;
        let result = outcome.unwrap_or_else(|_| {
            Err(StepFailure::Permanent {
                kind: CrmErrorKind::Other,
                message: "dispatch task panicked".to_string(),
                attempts: 0,
            })
        });
        (seqs, result)
    });
}

fn apply(
    shared: &JobShared,
    joined: Result<DispatchResult, JoinError>,
    fatal_errors: &[CrmErrorKind],
) {
    match joined {
        Ok((seqs, result)) => shared.complete(&seqs, result, fatal_errors),
        Err(err) => {
            error!(job_id = %shared.job_id(), error = %err, "Dispatch task did not complete");
        }
    }
}

async fn drain(
    shared: &JobShared,
    tasks: &mut JoinSet<DispatchResult>,
    fatal_errors: &[CrmErrorKind],
) {
    if !tasks.is_empty() {
        debug!(job_id = %shared.job_id(), in_flight = tasks.len(), "Waiting for in-flight calls");
    }
    while let Some(joined) = tasks.join_next().await {
        apply(shared, joined, fatal_errors);
    }
}
