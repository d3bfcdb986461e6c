use crate::error::SimError;
use crate::scheduler::StatusReport;
use crate::store::{JobEvent, JobRecord};
use crate::types::JobStatus;
use chrono::{TimeZone, Utc};
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde_json::json;

fn colored_status(status: JobStatus) -> String {
    match status {
        JobStatus::Completed => status.green().to_string(),
        JobStatus::Failed => status.red().to_string(),
        JobStatus::Stopped => status.yellow().to_string(),
        JobStatus::Paused => status.cyan().to_string(),
        _ => status.to_string(),
    }
}

fn timestamp(ms: Option<u64>) -> String {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_status(report: &StatusReport, format: &str) -> Result<String, SimError> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(report)?);
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Total", "Succeeded", "Failed", "Skipped", "Pending", "In flight"]);
    table.add_row(vec![
        report.steps_total.to_string(),
        report.steps_succeeded.to_string(),
        report.steps_failed.to_string(),
        report.steps_skipped.to_string(),
        report.steps_pending.to_string(),
        report.steps_in_flight.to_string(),
    ]);
    let mut out = format!(
        "Job {} is {}\nstarted {}, finished {}\n{}",
        report.job_id.bold(),
        colored_status(report.status),
        timestamp(report.started_at_ms),
        timestamp(report.completed_at_ms),
        table
    );
    if let Some(error) = &report.error {
        out.push_str(&format!("\n{} {}", "error:".red(), error));
    }
    Ok(out)
}

pub fn format_jobs(jobs: &[JobRecord], format: &str) -> Result<String, SimError> {
    if format == "json" {
        let rows: Vec<serde_json::Value> = jobs
            .iter()
            .map(|job| {
                json!({
                    "job_id": job.job_id,
                    "owner": job.owner,
                    "status": job.status,
                    "theme": job.config.theme,
                    "steps_total": job.steps_total,
                    "created_at_ms": job.created_at_ms,
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&rows)?);
    }
    if jobs.is_empty() {
        return Ok("No jobs".to_string());
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Job", "Owner", "Status", "Theme", "Steps", "Created"]);
    for job in jobs {
        table.add_row(vec![
            job.job_id.to_string(),
            job.owner.clone(),
            job.status.to_string(),
            job.config.theme.clone(),
            job.steps_total.to_string(),
            timestamp(Some(job.created_at_ms)),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_events(events: &[JobEvent], format: &str) -> Result<String, SimError> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(events)?);
    }
    let lines: Vec<String> = events
        .iter()
        .map(|event| {
            format!(
                "{:>6}  {}  {:<16} {}",
                event.seq,
                event.ts.dimmed(),
                event.event_type,
                event.data
            )
        })
        .collect();
    Ok(lines.join("\n"))
}
