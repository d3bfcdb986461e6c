//! Sled-backed progress store.

use crate::error::StorageError;
use crate::plan::Step;
use crate::store::{JobEvent, JobRecord, ProgressStore};
use crate::types::JobId;
use sled::{Batch, Db, Tree};
use std::io;
use std::path::Path;

const TREE_JOBS: &str = "sim_jobs";
const TREE_STEPS: &str = "sim_steps";
const TREE_EVENTS: &str = "sim_events";
const TREE_META: &str = "sim_event_meta";
const STEP_KEY_PAD: usize = 10;
const EVENT_KEY_PAD: usize = 20;

#[derive(Clone)]
pub struct SledProgressStore {
    db: Db,
    jobs: Tree,
    steps: Tree,
    events: Tree,
    meta: Tree,
}

impl SledProgressStore {
    pub fn new(db: Db) -> Result<Self, StorageError> {
        let jobs = db.open_tree(TREE_JOBS).map_err(to_storage_io)?;
        let steps = db.open_tree(TREE_STEPS).map_err(to_storage_io)?;
        let events = db.open_tree(TREE_EVENTS).map_err(to_storage_io)?;
        let meta = db.open_tree(TREE_META).map_err(to_storage_io)?;
        Ok(Self {
            db,
            jobs,
            steps,
            events,
            meta,
        })
    }

    /// Open (or create) a store in the directory at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::IoError(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "Failed to open progress store at {}: {}",
                    path.as_ref().display(),
                    e
                ),
            ))
        })?;
        Self::new(db)
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn next_event_seq(&self, job_id: &JobId) -> Result<u64, StorageError> {
        let updated = self
            .meta
            .update_and_fetch(job_id.as_str().as_bytes(), |old| {
                let current = old
                    .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })
            .map_err(to_storage_io)?;
        updated
            .and_then(|raw| <[u8; 8]>::try_from(raw.as_ref()).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| {
                StorageError::Corrupt(format!("event counter for job {} is unreadable", job_id))
            })
    }
}

impl ProgressStore for SledProgressStore {
    fn put_job(&self, job: &JobRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(job).map_err(to_storage_data)?;
        self.jobs
            .insert(job.job_id.as_str().as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(())
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, StorageError> {
        let Some(raw) = self
            .jobs
            .get(job_id.as_str().as_bytes())
            .map_err(to_storage_io)?
        else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
        Ok(Some(parsed))
    }

    fn list_jobs(&self) -> Result<Vec<JobRecord>, StorageError> {
        let mut out = Vec::new();
        for result in self.jobs.iter() {
            let (_, value) = result.map_err(to_storage_io)?;
            let rec: JobRecord = serde_json::from_slice(&value).map_err(to_storage_data)?;
            out.push(rec);
        }
        out.sort_by_key(|j| std::cmp::Reverse(j.created_at_ms));
        Ok(out)
    }

    fn put_step(&self, job_id: &JobId, step: &Step) -> Result<(), StorageError> {
        let value = serde_json::to_vec(step).map_err(to_storage_data)?;
        self.steps
            .insert(encode_step_key(job_id, step.seq).as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(())
    }

    fn put_steps(&self, job_id: &JobId, steps: &[Step]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for step in steps {
            let value = serde_json::to_vec(step).map_err(to_storage_data)?;
            batch.insert(encode_step_key(job_id, step.seq).as_bytes(), value);
        }
        self.steps.apply_batch(batch).map_err(to_storage_io)?;
        Ok(())
    }

    fn load_steps(&self, job_id: &JobId) -> Result<Vec<Step>, StorageError> {
        let prefix = format!("{}:", job_id);
        let mut out = Vec::new();
        for result in self.steps.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(to_storage_io)?;
            let step: Step = serde_json::from_slice(&value).map_err(to_storage_data)?;
            out.push(step);
        }
        out.sort_by_key(|s| s.seq);
        Ok(out)
    }

    fn append_event(
        &self,
        job_id: &JobId,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<JobEvent, StorageError> {
        let seq = self.next_event_seq(job_id)?;
        let event = JobEvent {
            job_id: job_id.clone(),
            seq,
            ts: chrono::Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            data,
        };
        let value = serde_json::to_vec(&event).map_err(to_storage_data)?;
        self.events
            .insert(encode_event_key(job_id, seq).as_bytes(), value)
            .map_err(to_storage_io)?;
        Ok(event)
    }

    fn read_events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, StorageError> {
        let prefix = format!("{}:", job_id);
        let mut out = Vec::new();
        for result in self.events.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result.map_err(to_storage_io)?;
            let parsed: JobEvent = serde_json::from_slice(&value).map_err(to_storage_data)?;
            if parsed.seq > after_seq {
                out.push(parsed);
            }
        }
        out.sort_by_key(|e| e.seq);
        Ok(out)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }
}

fn encode_step_key(job_id: &JobId, seq: u32) -> String {
    format!("{job_id}:{seq:0STEP_KEY_PAD$}")
}

fn encode_event_key(job_id: &JobId, seq: u64) -> String {
    format!("{job_id}:{seq:0EVENT_KEY_PAD$}")
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}
