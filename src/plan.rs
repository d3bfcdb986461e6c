//! Plan Builder
//!
//! Turns a [`SimulationConfig`] into a time-ordered list of [`Step`]s with
//! explicit placeholder dependencies. See [`PlanBuilder::build`].

pub mod builder;
pub mod spread;
pub mod step;

pub use builder::{AssociationRule, PlanBuilder, PlanSettings};
pub use spread::SpreadPolicy;
pub use step::{AssociationLink, Step, StepKind};

use crate::error::SimError;
use crate::types::RecordType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Simulation request as submitted by the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub theme: String,
    pub industry: String,
    pub duration_days: f64,
    #[serde(default)]
    pub record_distribution: RecordDistribution,
}

/// Requested record counts. Names beyond the five well-known ones land in
/// `additional` and are matched against known record types at build time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDistribution {
    #[serde(default)]
    pub contacts: i64,
    #[serde(default)]
    pub companies: i64,
    #[serde(default)]
    pub deals: i64,
    #[serde(default)]
    pub tickets: i64,
    #[serde(default)]
    pub notes: i64,
    #[serde(flatten)]
    pub additional: BTreeMap<String, i64>,
}

impl RecordDistribution {
    /// Validated per-type counts.
    pub fn counts(&self) -> Result<BTreeMap<RecordType, u32>, SimError> {
        let named = [
            ("contacts", RecordType::Contact, self.contacts),
            ("companies", RecordType::Company, self.companies),
            ("deals", RecordType::Deal, self.deals),
            ("tickets", RecordType::Ticket, self.tickets),
            ("notes", RecordType::Note, self.notes),
        ];
        let mut counts = BTreeMap::new();
        for (name, record_type, count) in named {
            counts.insert(record_type, checked_count(name, count)?);
        }
        for (name, count) in &self.additional {
            let record_type: RecordType = name.parse().map_err(SimError::InvalidConfiguration)?;
            let count = checked_count(name, *count)?;
            if counts.get(&record_type).copied().unwrap_or(0) > 0 && count > 0 {
                return Err(SimError::InvalidConfiguration(format!(
                    "record type '{}' is requested twice",
                    record_type
                )));
            }
            let slot = counts.entry(record_type).or_insert(0);
            *slot = (*slot).max(count);
        }
        Ok(counts)
    }
}

fn checked_count(name: &str, count: i64) -> Result<u32, SimError> {
    if count < 0 {
        return Err(SimError::InvalidConfiguration(format!(
            "count for '{}' cannot be negative ({})",
            name, count
        )));
    }
    u32::try_from(count).map_err(|_| {
        SimError::InvalidConfiguration(format!("count for '{}' is too large ({})", name, count))
    })
}

/// A built plan: steps in total order plus the simulated span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub duration_ms: u64,
}

impl Plan {
    fn count_kind(&self, name: &str) -> usize {
        self.steps.iter().filter(|s| s.kind.name() == name).count()
    }

    pub fn create_count(&self) -> usize {
        self.count_kind("create")
    }

    pub fn associate_count(&self) -> usize {
        self.count_kind("associate")
    }

    pub fn update_count(&self) -> usize {
        self.count_kind("update")
    }

    /// Creates per record type.
    pub fn records_by_type(&self) -> BTreeMap<RecordType, usize> {
        let mut out = BTreeMap::new();
        for step in &self.steps {
            if step.creates().is_some() {
                *out.entry(step.record_type()).or_insert(0) += 1;
            }
        }
        out
    }

    pub fn digest(&self) -> String {
        plan_digest(&self.steps)
    }
}

/// Digest over the immutable part of each step (sequence, offset, payload).
pub fn plan_digest(steps: &[Step]) -> String {
    let mut hasher = blake3::Hasher::new();
    for step in steps {
        let bytes = serde_json::to_vec(&(step.seq, step.offset_ms, &step.kind)).unwrap_or_default();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize().as_bytes())
}
