//! Job Scheduler/Runner
//!
//! One long-lived runner task per active job walks the plan in time order,
//! dispatches ready steps through the executor with bounded concurrency, and
//! records every outcome in the progress store. [`JobManager`] is the control
//! surface: start, pause, resume, stop, status.
//!
//! Job states: `pending -> running -> {paused <-> running} -> {stopped | completed | failed}`.

pub mod clock;
pub mod job;
pub mod manager;
pub mod runner;

pub use clock::{Pacing, PlanClock};
pub use manager::{JobManager, ManagerSettings, RecoveryReport};

use crate::crm::CrmErrorKind;
use crate::plan::Step;
use crate::store::JobRecord;
use crate::types::{JobId, JobStatus, StepStatus};
use serde::{Deserialize, Serialize};

/// The `scheduler` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Maximum CRM calls in flight per job.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub pacing: Pacing,

    /// Permanent error kinds that abort the whole job.
    #[serde(default = "default_fatal_errors")]
    pub fatal_errors: Vec<CrmErrorKind>,

    /// Upper bound on records in one batched update call.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_workers() -> usize {
    4
}

fn default_fatal_errors() -> Vec<CrmErrorKind> {
    vec![CrmErrorKind::Authentication]
}

fn default_max_batch_size() -> usize {
    100
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            pacing: Pacing::default(),
            fatal_errors: default_fatal_errors(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".to_string());
        }
        self.pacing.validate()
    }
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub steps_total: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_pending: usize,
    /// In flight, including steps waiting out a retry.
    pub steps_in_flight: usize,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub error: Option<String>,
}

impl StatusReport {
    pub fn from_parts(record: &JobRecord, steps: &[Step]) -> Self {
        let count = |wanted: &[StepStatus]| steps.iter().filter(|s| wanted.contains(&s.status)).count();
        Self {
            job_id: record.job_id.clone(),
            status: record.status,
            steps_total: steps.len(),
            steps_succeeded: count(&[StepStatus::Succeeded]),
            steps_failed: count(&[StepStatus::FailedPermanent]),
            steps_skipped: count(&[StepStatus::Skipped]),
            steps_pending: count(&[StepStatus::Pending]),
            steps_in_flight: count(&[StepStatus::InFlight, StepStatus::FailedRetryable]),
            started_at_ms: record.started_at_ms,
            completed_at_ms: record.completed_at_ms,
            error: record.error.clone(),
        }
    }
}
