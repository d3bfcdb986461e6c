//! Every plan puts creates before the steps that reference them.

use crmsim::content::TemplateContent;
use crmsim::plan::{PlanBuilder, PlanSettings, RecordDistribution, SimulationConfig};
use proptest::prelude::*;
use std::collections::HashMap;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn creates_precede_their_dependents(
        contacts in 0i64..8,
        companies in 0i64..5,
        deals in 0i64..5,
        tickets in 0i64..4,
        notes in 0i64..4,
        seed in any::<u64>(),
        lifecycle_updates in any::<bool>(),
    ) {
        let settings = PlanSettings {
            seed: Some(seed),
            lifecycle_updates,
            ..PlanSettings::default()
        };
        let content = TemplateContent::default();
        let config = SimulationConfig {
            theme: "Space Pirates".to_string(),
            industry: "Logistics".to_string(),
            duration_days: 3.0,
            record_distribution: RecordDistribution {
                contacts,
                companies,
                deals,
                tickets,
                notes,
                ..Default::default()
            },
        };
        let plan = PlanBuilder::new(&settings, &content).build(&config).unwrap();

        let total = contacts + companies + deals + tickets + notes;
        prop_assert_eq!(plan.create_count() as i64, total);

        let mut created_at = HashMap::new();
        let mut last_offset = 0;
        for (index, step) in plan.steps.iter().enumerate() {
            prop_assert_eq!(step.seq as usize, index);
            prop_assert!(step.offset_ms >= last_offset);
            prop_assert!(step.offset_ms <= plan.duration_ms);
            last_offset = step.offset_ms;
            for dep in &step.depends_on {
                let produced = created_at.get(dep).copied();
                prop_assert!(produced.is_some(), "{} used before it is created", dep);
                prop_assert!(produced.unwrap_or(u64::MAX) <= step.offset_ms);
            }
            if let Some(placeholder) = step.creates() {
                created_at.insert(placeholder.clone(), step.offset_ms);
            }
        }
    }
}
