//! Error types for the CRM simulation engine.

use crate::types::{JobId, JobStatus, Placeholder};
use thiserror::Error;

/// Progress store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Engine-level errors surfaced through the job control surface.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Placeholder {0} already has an identifier")]
    DuplicatePlaceholder(Placeholder),

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(Placeholder),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Cannot {action} job {job_id} while it is {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        action: &'static str,
    },

    #[error("Plan integrity check failed: {0}")]
    PlanIntegrity(String),

    #[error("CRM client error: {0}")]
    Crm(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for SimError {
    fn from(err: config::ConfigError) -> Self {
        SimError::ConfigError(err.to_string())
    }
}
