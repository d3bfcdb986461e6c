//! Content source boundary
//!
//! Supplies per-record field values. The engine treats the output as an opaque
//! field map and only checks required-field presence.

use crate::crm::FieldMap;
use crate::types::RecordType;
use serde_json::json;
use std::collections::BTreeSet;

/// What a content source is asked to fill in.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub record_type: RecordType,
    pub index: u32,
    pub theme: &'a str,
    pub industry: &'a str,
}

pub trait ContentSource: Send + Sync {
    /// Whether this source has a field-generation strategy for the type.
    fn supports(&self, record_type: RecordType) -> bool;

    fn fields(&self, ctx: &RecordContext<'_>) -> FieldMap;
}

const FIRST_NAMES: &[&str] = &[
    "Avery", "Jordan", "Morgan", "Riley", "Casey", "Quinn", "Harper", "Rowan", "Emerson", "Sage",
];

const LAST_NAMES: &[&str] = &[
    "Okafor", "Lindqvist", "Moreau", "Tanaka", "Alvarez", "Petrov", "Nguyen", "Brennan", "Haddad",
    "Kowalski",
];

const JOB_TITLES: &[&str] = &[
    "Operations Manager",
    "Head of Procurement",
    "Marketing Director",
    "Account Executive",
    "Chief Financial Officer",
    "IT Administrator",
];

const COMPANY_SUFFIXES: &[&str] = &["Labs", "Group", "Partners", "Works", "Collective", "Systems"];

/// Deterministic field generator keyed on theme, industry and record index.
#[derive(Debug, Clone)]
pub struct TemplateContent {
    supported: BTreeSet<RecordType>,
}

impl Default for TemplateContent {
    fn default() -> Self {
        Self {
            supported: RecordType::ALL.into_iter().collect(),
        }
    }
}

impl TemplateContent {
    pub fn with_types(types: impl IntoIterator<Item = RecordType>) -> Self {
        Self {
            supported: types.into_iter().collect(),
        }
    }
}

fn pick<'a>(options: &[&'a str], index: u32, salt: u32) -> &'a str {
    options[(index.wrapping_mul(7).wrapping_add(salt) as usize) % options.len()]
}

fn slug(text: &str) -> String {
    let slug: String = text
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() || c == '-' {
                Some('-')
            } else {
                None
            }
        })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "sim".to_string()
    } else {
        trimmed.to_string()
    }
}

impl ContentSource for TemplateContent {
    fn supports(&self, record_type: RecordType) -> bool {
        self.supported.contains(&record_type)
    }

    fn fields(&self, ctx: &RecordContext<'_>) -> FieldMap {
        let mut fields = FieldMap::new();
        let i = ctx.index;
        let theme = slug(ctx.theme);
        match ctx.record_type {
            RecordType::Contact => {
                let first = pick(FIRST_NAMES, i, 0);
                let last = pick(LAST_NAMES, i, 3);
                fields.insert(
                    "email".into(),
                    json!(format!(
                        "{}.{}.{}@{}.example.com",
                        first.to_ascii_lowercase(),
                        last.to_ascii_lowercase(),
                        i,
                        theme
                    )),
                );
                fields.insert("firstname".into(), json!(first));
                fields.insert("lastname".into(), json!(last));
                fields.insert("jobtitle".into(), json!(pick(JOB_TITLES, i, 1)));
            }
            RecordType::Company => {
                let name = format!(
                    "{} {} {}",
                    ctx.industry,
                    pick(COMPANY_SUFFIXES, i, 2),
                    i + 1
                );
                fields.insert("domain".into(), json!(format!("{}-{}.example.com", slug(&name), theme)));
                fields.insert("name".into(), json!(name));
                fields.insert("industry".into(), json!(ctx.industry));
            }
            RecordType::Deal => {
                fields.insert(
                    "dealname".into(),
                    json!(format!("{} {} opportunity #{}", ctx.theme, ctx.industry, i + 1)),
                );
                fields.insert("amount".into(), json!(((i % 20) + 1) * 2_500));
                fields.insert("pipeline".into(), json!("default"));
                fields.insert("dealstage".into(), json!("appointmentscheduled"));
            }
            RecordType::Ticket => {
                fields.insert(
                    "subject".into(),
                    json!(format!("{} support request #{}", ctx.industry, i + 1)),
                );
                fields.insert(
                    "content".into(),
                    json!(format!("Customer reported an issue while using {}.", ctx.theme)),
                );
                fields.insert("hs_pipeline".into(), json!("0"));
                fields.insert("hs_pipeline_stage".into(), json!("1"));
            }
            RecordType::Note => {
                fields.insert(
                    "hs_note_body".into(),
                    json!(format!("Follow-up call #{} about {} needs.", i + 1, ctx.industry)),
                );
            }
            RecordType::Task => {
                fields.insert(
                    "hs_task_subject".into(),
                    json!(format!("Send {} proposal #{}", ctx.theme, i + 1)),
                );
                fields.insert("hs_task_status".into(), json!("NOT_STARTED"));
            }
        }
        fields
    }
}
