//! Expands a simulation configuration into a totally ordered step list.

use crate::content::{ContentSource, RecordContext};
use crate::crm::FieldMap;
use crate::error::SimError;
use crate::plan::spread::{self, SpreadPolicy};
use crate::plan::step::{AssociationLink, Step, StepKind};
use crate::plan::{Plan, SimulationConfig};
use crate::types::{Placeholder, RecordType};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tracing::debug;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Attach every `from` record to a `to` record, chosen round-robin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRule {
    pub from: RecordType,
    pub to: RecordType,
    /// Defaults to `<from>_to_<to>`.
    #[serde(default)]
    pub association_type: Option<String>,
    /// Defaults to the plan-wide association category.
    #[serde(default)]
    pub category: Option<String>,
}

impl AssociationRule {
    pub fn new(from: RecordType, to: RecordType) -> Self {
        Self {
            from,
            to,
            association_type: None,
            category: None,
        }
    }

    pub fn association_type(&self) -> String {
        self.association_type
            .clone()
            .unwrap_or_else(|| format!("{}_to_{}", self.from, self.to))
    }
}

/// Plan-building knobs (the `plan` configuration section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSettings {
    #[serde(default = "default_max_total_records")]
    pub max_total_records: u32,

    #[serde(default)]
    pub spread: SpreadPolicy,

    /// Fixed RNG seed for reproducible plans.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default = "default_association_category")]
    pub association_category: String,

    #[serde(default = "default_association_rules")]
    pub association_rules: Vec<AssociationRule>,

    /// Add a later update step per deal (close won) and ticket (closed).
    #[serde(default)]
    pub lifecycle_updates: bool,

    /// Bucket weights per record type, used by the `curve` spread.
    #[serde(default)]
    pub timing_curve: BTreeMap<RecordType, Vec<f64>>,
}

fn default_max_total_records() -> u32 {
    5_000
}

fn default_association_category() -> String {
    "HUBSPOT_DEFINED".to_string()
}

pub fn default_association_rules() -> Vec<AssociationRule> {
    use RecordType::*;
    [
        (Deal, Contact),
        (Deal, Company),
        (Ticket, Contact),
        (Ticket, Company),
        (Note, Contact),
        (Task, Contact),
    ]
    .into_iter()
    .map(|(from, to)| AssociationRule::new(from, to))
    .collect()
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            max_total_records: default_max_total_records(),
            spread: SpreadPolicy::default(),
            seed: None,
            association_category: default_association_category(),
            association_rules: default_association_rules(),
            lifecycle_updates: false,
            timing_curve: BTreeMap::new(),
        }
    }
}

impl PlanSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_total_records == 0 {
            return Err("max_total_records must be greater than zero".to_string());
        }
        if self.association_category.trim().is_empty() {
            return Err("association_category cannot be empty".to_string());
        }
        for rule in &self.association_rules {
            if rule.from == rule.to {
                return Err(format!("association rule {} -> {} links a type to itself", rule.from, rule.to));
            }
        }
        for (record_type, weights) in &self.timing_curve {
            if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(format!("timing curve for {} needs non-negative finite weights", record_type));
            }
            if weights.iter().all(|w| *w == 0.0) {
                return Err(format!("timing curve for {} has no positive weight", record_type));
            }
        }
        Ok(())
    }
}

/// Pre-ordering step, before sequence numbers are assigned.
struct Draft {
    offset_ms: u64,
    kind: StepKind,
}

impl Draft {
    fn rank(&self) -> u8 {
        match self.kind {
            StepKind::Create { .. } => 0,
            StepKind::Associate { .. } => 1,
            StepKind::Update { .. } => 2,
        }
    }
}

pub struct PlanBuilder<'a> {
    settings: &'a PlanSettings,
    content: &'a dyn ContentSource,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(settings: &'a PlanSettings, content: &'a dyn ContentSource) -> Self {
        Self { settings, content }
    }

    /// Build the full plan. Pure: nothing here talks to the CRM.
    pub fn build(&self, config: &SimulationConfig) -> Result<Plan, SimError> {
        self.settings
            .validate()
            .map_err(SimError::InvalidConfiguration)?;
        let duration_ms = duration_ms(config.duration_days)?;
        let counts = config.record_distribution.counts()?;

        let total: u64 = counts.values().map(|c| *c as u64).sum();
        if total > self.settings.max_total_records as u64 {
            return Err(SimError::InvalidConfiguration(format!(
                "{} records requested, ceiling is {}",
                total, self.settings.max_total_records
            )));
        }
        for (record_type, count) in &counts {
            if *count > 0 && !self.content.supports(*record_type) {
                return Err(SimError::InvalidConfiguration(format!(
                    "no field-generation strategy for record type '{}'",
                    record_type
                )));
            }
        }

        let mut rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut drafts = Vec::new();
        let mut create_offsets: HashMap<Placeholder, u64> = HashMap::new();
        for record_type in RecordType::ALL {
            let count = counts.get(&record_type).copied().unwrap_or(0);
            let curve = self
                .settings
                .timing_curve
                .get(&record_type)
                .map(Vec::as_slice);
            let offsets = spread::offsets(
                self.settings.spread,
                record_type,
                count,
                duration_ms,
                curve,
                &mut rng,
            )?;
            for (index, offset_ms) in (0..count).zip(offsets) {
                let ctx = RecordContext {
                    record_type,
                    index,
                    theme: &config.theme,
                    industry: &config.industry,
                };
                let fields = self.content.fields(&ctx);
                check_required_fields(record_type, index, &fields)?;
                let placeholder = Placeholder::new(record_type, index);
                create_offsets.insert(placeholder.clone(), offset_ms);
                drafts.push(Draft {
                    offset_ms,
                    kind: StepKind::Create {
                        record_type,
                        placeholder,
                        fields,
                    },
                });
            }
        }

        drafts.extend(self.association_drafts(&counts, &create_offsets));
        if self.settings.lifecycle_updates {
            drafts.extend(lifecycle_drafts(&counts, &create_offsets, duration_ms));
        }

        let steps = order(drafts)?;
        debug!(
            steps = steps.len(),
            records = total,
            duration_ms,
            "Simulation plan built"
        );
        Ok(Plan { steps, duration_ms })
    }

    fn association_drafts(
        &self,
        counts: &BTreeMap<RecordType, u32>,
        create_offsets: &HashMap<Placeholder, u64>,
    ) -> Vec<Draft> {
        let mut drafts = Vec::new();
        for from_type in RecordType::ALL {
            let from_count = counts.get(&from_type).copied().unwrap_or(0);
            let rules: Vec<&AssociationRule> = self
                .settings
                .association_rules
                .iter()
                .filter(|r| r.from == from_type && counts.get(&r.to).copied().unwrap_or(0) > 0)
                .collect();
            if rules.is_empty() {
                continue;
            }
            for index in 0..from_count {
                let from = Placeholder::new(from_type, index);
                let mut groups: BTreeMap<String, Vec<AssociationLink>> = BTreeMap::new();
                for rule in &rules {
                    let to_count = counts.get(&rule.to).copied().unwrap_or(0);
                    let link = AssociationLink {
                        to: Placeholder::new(rule.to, index % to_count),
                        association_type: rule.association_type(),
                    };
                    let category = rule
                        .category
                        .clone()
                        .unwrap_or_else(|| self.settings.association_category.clone());
                    let links = groups.entry(category).or_default();
                    if !links.contains(&link) {
                        links.push(link);
                    }
                }
                for (category, links) in groups {
                    let offset_ms = std::iter::once(&from)
                        .chain(links.iter().map(|l| &l.to))
                        .filter_map(|p| create_offsets.get(p).copied())
                        .max()
                        .unwrap_or(0);
                    drafts.push(Draft {
                        offset_ms,
                        kind: StepKind::Associate {
                            from: from.clone(),
                            category,
                            links,
                        },
                    });
                }
            }
        }
        drafts
    }
}

fn lifecycle_drafts(
    counts: &BTreeMap<RecordType, u32>,
    create_offsets: &HashMap<Placeholder, u64>,
    duration_ms: u64,
) -> Vec<Draft> {
    let mut drafts = Vec::new();
    for (record_type, field, value) in [
        (RecordType::Deal, "dealstage", "closedwon"),
        (RecordType::Ticket, "hs_pipeline_stage", "4"),
    ] {
        for index in 0..counts.get(&record_type).copied().unwrap_or(0) {
            let target = Placeholder::new(record_type, index);
            let created = create_offsets.get(&target).copied().unwrap_or(0);
            let mut fields = FieldMap::new();
            fields.insert(field.to_string(), json!(value));
            drafts.push(Draft {
                offset_ms: created + (duration_ms - created) / 2,
                kind: StepKind::Update { target, fields },
            });
        }
    }
    drafts
}

fn duration_ms(days: f64) -> Result<u64, SimError> {
    if !days.is_finite() || days <= 0.0 {
        return Err(SimError::InvalidConfiguration(format!(
            "durationDays must be a positive number, got {}",
            days
        )));
    }
    let ms = (days * MS_PER_DAY).round();
    if ms < 1.0 || ms > u64::MAX as f64 {
        return Err(SimError::InvalidConfiguration(format!(
            "durationDays {} is out of range",
            days
        )));
    }
    Ok(ms as u64)
}

fn check_required_fields(
    record_type: RecordType,
    index: u32,
    fields: &FieldMap,
) -> Result<(), SimError> {
    for required in record_type.required_fields() {
        let present = match fields.get(*required) {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(SimError::InvalidConfiguration(format!(
                "content for {}:{} is missing required field '{}'",
                record_type, index, required
            )));
        }
    }
    Ok(())
}

/// Topologically order drafts, breaking ties by `key`. Fails on cycles and on
/// references to placeholders no draft creates.
fn topo_order<K: Ord>(drafts: &[Draft], key: impl Fn(usize) -> K) -> Result<Vec<usize>, SimError> {
    let producers: HashMap<&Placeholder, usize> = drafts
        .iter()
        .enumerate()
        .filter_map(|(i, d)| match &d.kind {
            StepKind::Create { placeholder, .. } => Some((placeholder, i)),
            _ => None,
        })
        .collect();

    let mut indegree = vec![0usize; drafts.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); drafts.len()];
    for (i, draft) in drafts.iter().enumerate() {
        for dep in draft.kind.dependencies() {
            let producer = producers.get(&dep).copied().ok_or_else(|| {
                SimError::InvalidConfiguration(format!(
                    "step references {} which the plan does not create",
                    dep
                ))
            })?;
            dependents[producer].push(i);
            indegree[i] += 1;
        }
    }

    let mut heap: BinaryHeap<Reverse<(K, usize)>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse((key(i), i)))
        .collect();
    let mut ordered = Vec::with_capacity(drafts.len());
    while let Some(Reverse((_, i))) = heap.pop() {
        ordered.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                heap.push(Reverse((key(next), next)));
            }
        }
    }
    if ordered.len() != drafts.len() {
        return Err(SimError::InvalidConfiguration(
            "circular reference between generated records".to_string(),
        ));
    }
    Ok(ordered)
}

/// Assign sequence numbers: producers first, then by offset, kind and draft order.
fn order(mut drafts: Vec<Draft>) -> Result<Vec<Step>, SimError> {
    // A dependent never runs earlier than what it depends on.
    let first_pass = topo_order(&drafts, |i| i)?;
    let mut produced_at: HashMap<Placeholder, u64> = HashMap::new();
    for &i in &first_pass {
        let floor = drafts[i]
            .kind
            .dependencies()
            .iter()
            .filter_map(|p| produced_at.get(p).copied())
            .max()
            .unwrap_or(0);
        let draft = &mut drafts[i];
        draft.offset_ms = draft.offset_ms.max(floor);
        if let StepKind::Create { placeholder, .. } = &draft.kind {
            produced_at.insert(placeholder.clone(), draft.offset_ms);
        }
    }

    let ordered = topo_order(&drafts, |i| (drafts[i].offset_ms, drafts[i].rank(), i))?;
    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    let mut steps = Vec::with_capacity(ordered.len());
    for (seq, i) in ordered.into_iter().enumerate() {
        if let Some(draft) = slots[i].take() {
            steps.push(Step::new(seq as u32, draft.offset_ms, draft.kind));
        }
    }
    Ok(steps)
}
