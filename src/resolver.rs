//! Reference Resolver
//!
//! Append-only map from plan placeholders to CRM-assigned identifiers, and the
//! only path from a [`StepKind`] to a wire [`Operation`]. An operation can be
//! built only once every placeholder in the step has a real identifier.

use crate::crm::{AssociationInput, AssociationRequest, FieldMap, RecordUpdate};
use crate::error::SimError;
use crate::executor::Operation;
use crate::plan::step::{placeholder_tokens, Step, StepKind};
use crate::types::{Placeholder, RecordId};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ReferenceResolver {
    ids: RwLock<HashMap<Placeholder, RecordId>>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted (placeholder, id) pairs.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (Placeholder, RecordId)>,
    ) -> Result<Self, SimError> {
        let resolver = Self::new();
        for (placeholder, id) in entries {
            resolver.record(placeholder, id)?;
        }
        Ok(resolver)
    }

    /// Store the identifier for `placeholder`. A second write for the same
    /// placeholder fails, even with the same identifier.
    pub fn record(&self, placeholder: Placeholder, id: RecordId) -> Result<(), SimError> {
        let mut ids = self.ids.write();
        if ids.contains_key(&placeholder) {
            return Err(SimError::DuplicatePlaceholder(placeholder));
        }
        debug!(placeholder = %placeholder, id = %id, "Placeholder resolved");
        ids.insert(placeholder, id);
        Ok(())
    }

    pub fn get(&self, placeholder: &Placeholder) -> Option<RecordId> {
        self.ids.read().get(placeholder).cloned()
    }

    pub fn is_ready(&self, step: &Step) -> bool {
        let ids = self.ids.read();
        step.depends_on.iter().all(|p| ids.contains_key(p))
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<Placeholder, RecordId> {
        self.ids
            .read()
            .iter()
            .map(|(p, id)| (p.clone(), id.clone()))
            .collect()
    }

    /// Substitute every placeholder in `kind` and produce the wire operation.
    pub fn resolve(&self, kind: &StepKind) -> Result<Operation, SimError> {
        let ids = self.ids.read();
        let lookup = |p: &Placeholder| {
            ids.get(p)
                .cloned()
                .ok_or_else(|| SimError::UnresolvedReference(p.clone()))
        };
        match kind {
            StepKind::Create {
                record_type,
                fields,
                ..
            } => Ok(Operation::Create {
                record_type: *record_type,
                fields: resolve_fields(fields, &lookup)?,
            }),
            StepKind::Associate {
                from,
                category,
                links,
            } => {
                let inputs = links
                    .iter()
                    .map(|link| -> Result<AssociationInput, SimError> {
                        Ok(AssociationInput {
                            to_type: link.to.record_type(),
                            to_id: lookup(&link.to)?,
                            association_type: link.association_type.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>, SimError>>()?;
                Ok(Operation::Associate(AssociationRequest {
                    from_type: from.record_type(),
                    from_id: lookup(from)?,
                    category: category.clone(),
                    inputs,
                }))
            }
            StepKind::Update { target, fields } => Ok(Operation::Update {
                record_type: target.record_type(),
                updates: vec![RecordUpdate {
                    id: lookup(target)?,
                    fields: resolve_fields(fields, &lookup)?,
                }],
            }),
        }
    }
}

fn resolve_fields(
    fields: &FieldMap,
    lookup: &impl Fn(&Placeholder) -> Result<RecordId, SimError>,
) -> Result<FieldMap, SimError> {
    fields
        .iter()
        .map(|(name, value)| -> Result<(String, Value), SimError> {
            Ok((name.clone(), resolve_value(value, lookup)?))
        })
        .collect()
}

fn resolve_value(
    value: &Value,
    lookup: &impl Fn(&Placeholder) -> Result<RecordId, SimError>,
) -> Result<Value, SimError> {
    Ok(match value {
        Value::String(text) => Value::String(resolve_text(text, lookup)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, lookup))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| -> Result<(String, Value), SimError> {
                    Ok((k.clone(), resolve_value(v, lookup)?))
                })
                .collect::<Result<_, _>>()?,
        ),
        other => other.clone(),
    })
}

fn resolve_text(
    text: &str,
    lookup: &impl Fn(&Placeholder) -> Result<RecordId, SimError>,
) -> Result<String, SimError> {
    let tokens = placeholder_tokens(text);
    if tokens.is_empty() {
        return Ok(text.to_string());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        match Placeholder::parse(after[..end].trim()) {
            Ok(placeholder) => out.push_str(lookup(&placeholder)?.as_str()),
            Err(_) => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
