use crate::error::SimError;
use crate::plan::Plan;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde_json::json;

pub fn format_plan(plan: &Plan, format: &str) -> Result<String, SimError> {
    let by_type = plan.records_by_type();
    if format == "json" {
        let records: serde_json::Map<String, serde_json::Value> = by_type
            .iter()
            .map(|(record_type, count)| (record_type.to_string(), json!(count)))
            .collect();
        let value = json!({
            "steps_total": plan.steps.len(),
            "creates": plan.create_count(),
            "associations": plan.associate_count(),
            "updates": plan.update_count(),
            "duration_ms": plan.duration_ms,
            "digest": plan.digest(),
            "records": records,
        });
        return Ok(serde_json::to_string_pretty(&value)?);
    }

    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Record type", "Records"]);
    for (record_type, count) in &by_type {
        table.add_row(vec![record_type.to_string(), count.to_string()]);
    }

    let hours = plan.duration_ms as f64 / 3_600_000.0;
    Ok(format!(
        "{}\n{}\n{} steps: {} creates, {} associations, {} updates over {:.1}h\ndigest {}",
        "Plan".bold().underline(),
        table,
        plan.steps.len(),
        plan.create_count(),
        plan.associate_count(),
        plan.update_count(),
        hours,
        &plan.digest()[..16]
    ))
}
