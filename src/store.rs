//! Progress Store
//!
//! Durable job state: one record per job, one row per step, and an ordered
//! event log per job. Written incrementally as steps change, so a crash leaves
//! a resumable partial state.

pub mod persistence;

pub use persistence::SledProgressStore;

use crate::error::StorageError;
use crate::plan::{SimulationConfig, Step};
use crate::types::{JobId, JobStatus};
use serde::{Deserialize, Serialize};

/// Persisted job header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub owner: String,
    pub config: SimulationConfig,
    pub status: JobStatus,
    pub created_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub completed_at_ms: Option<u64>,
    /// Digest of the planned steps, checked when the job is reloaded.
    pub plan_digest: String,
    pub duration_ms: u64,
    pub steps_total: usize,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

/// One entry of a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub seq: u64,
    /// RFC3339 timestamp.
    pub ts: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

pub trait ProgressStore: Send + Sync {
    fn put_job(&self, job: &JobRecord) -> Result<(), StorageError>;

    fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, StorageError>;

    /// All jobs, newest first.
    fn list_jobs(&self) -> Result<Vec<JobRecord>, StorageError>;

    fn put_step(&self, job_id: &JobId, step: &Step) -> Result<(), StorageError>;

    /// Write several steps atomically.
    fn put_steps(&self, job_id: &JobId, steps: &[Step]) -> Result<(), StorageError>;

    /// Steps of a job in sequence order.
    fn load_steps(&self, job_id: &JobId) -> Result<Vec<Step>, StorageError>;

    /// Append an event and return it with its assigned sequence number.
    fn append_event(
        &self,
        job_id: &JobId,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<JobEvent, StorageError>;

    /// Events with `seq > after_seq`, in order.
    fn read_events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}
