use crate::crm::FieldMap;
use crate::types::{Placeholder, RecordId, RecordType, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One target of a batched association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationLink {
    pub to: Placeholder,
    pub association_type: String,
}

/// What a step does. Field values may carry `{{type:index}}` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Create {
        record_type: RecordType,
        placeholder: Placeholder,
        fields: FieldMap,
    },
    Associate {
        from: Placeholder,
        category: String,
        links: Vec<AssociationLink>,
    },
    Update {
        target: Placeholder,
        fields: FieldMap,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Create { .. } => "create",
            StepKind::Associate { .. } => "associate",
            StepKind::Update { .. } => "update",
        }
    }

    /// Every placeholder this step needs resolved before dispatch.
    pub fn dependencies(&self) -> BTreeSet<Placeholder> {
        let mut deps = BTreeSet::new();
        match self {
            StepKind::Create { fields, .. } => {
                for value in fields.values() {
                    collect_value_placeholders(value, &mut deps);
                }
            }
            StepKind::Associate { from, links, .. } => {
                deps.insert(from.clone());
                deps.extend(links.iter().map(|l| l.to.clone()));
            }
            StepKind::Update { target, fields } => {
                deps.insert(target.clone());
                for value in fields.values() {
                    collect_value_placeholders(value, &mut deps);
                }
            }
        }
        deps
    }
}

/// A planned unit of work plus its execution progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub seq: u32,
    /// Scheduled offset within the simulated span.
    pub offset_ms: u64,
    #[serde(flatten)]
    pub kind: StepKind,
    pub depends_on: BTreeSet<Placeholder>,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Identifier assigned by the CRM, for create steps that succeeded.
    #[serde(default)]
    pub real_id: Option<RecordId>,
    /// Set when this step's failure aborted the job.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Step {
    pub fn new(seq: u32, offset_ms: u64, kind: StepKind) -> Self {
        let depends_on = kind.dependencies();
        Self {
            seq,
            offset_ms,
            kind,
            depends_on,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            real_id: None,
            fatal: false,
            updated_at_ms: 0,
        }
    }

    /// Placeholder produced by this step, if it is a create step.
    pub fn creates(&self) -> Option<&Placeholder> {
        match &self.kind {
            StepKind::Create { placeholder, .. } => Some(placeholder),
            _ => None,
        }
    }

    /// Record type of the record this step writes.
    pub fn record_type(&self) -> RecordType {
        match &self.kind {
            StepKind::Create { record_type, .. } => *record_type,
            StepKind::Associate { from, .. } => from.record_type(),
            StepKind::Update { target, .. } => target.record_type(),
        }
    }

    /// Batching key for association steps: primary record and category.
    pub fn association_key(&self) -> Option<(Placeholder, String)> {
        match &self.kind {
            StepKind::Associate { from, category, .. } => Some((from.clone(), category.clone())),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match &self.kind {
            StepKind::Create { placeholder, .. } => format!("create {}", placeholder),
            StepKind::Associate { from, links, .. } => {
                format!("associate {} ({} links)", from, links.len())
            }
            StepKind::Update { target, .. } => format!("update {}", target),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Placeholders named by `{{type:index}}` tokens in `text`.
///
/// Braced text that does not parse as a placeholder is left alone.
pub fn placeholder_tokens(text: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if let Ok(placeholder) = Placeholder::parse(after[..end].trim()) {
                    found.push(placeholder);
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    found
}

pub(crate) fn collect_value_placeholders(value: &Value, out: &mut BTreeSet<Placeholder>) {
    match value {
        Value::String(text) => out.extend(placeholder_tokens(text)),
        Value::Array(items) => {
            for item in items {
                collect_value_placeholders(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value_placeholders(item, out);
            }
        }
        _ => {}
    }
}
