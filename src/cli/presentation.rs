//! CLI presentation: text and json formatters per command family.

mod job;
mod plan;

pub use job::{format_events, format_jobs, format_status};
pub use plan::format_plan;
