//! CLI domain: parse, route, output, and presentation only.
//! No orchestration here; the route table hands each command to the job manager.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{format_events, format_jobs, format_plan, format_status};
pub use route::RunContext;
