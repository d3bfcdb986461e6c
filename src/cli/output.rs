//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::SimError;

/// Map domain errors to a one-line message, with a hint where one helps.
pub fn map_error(e: &SimError) -> String {
    match e {
        SimError::InvalidTransition { job_id, .. } => {
            format!("{} (see `crmsim status {}`)", e, job_id)
        }
        SimError::StorageError(_) => format!(
            "{} (is another crmsim process using the same store?)",
            e
        ),
        _ => e.to_string(),
    }
}
