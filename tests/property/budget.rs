//! A window never grants more than its ceiling.

use crmsim::executor::RateBudget;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #[test]
    fn grants_within_one_window_stop_at_the_ceiling(ceiling in 1u32..20, attempts in 0usize..60) {
        let budget = RateBudget::new(Duration::from_secs(600), ceiling);
        let mut granted = Vec::new();
        for _ in 0..attempts {
            if let Ok(grant) = budget.try_acquire() {
                granted.push(grant.ordinal);
            }
        }
        prop_assert_eq!(granted.len(), attempts.min(ceiling as usize));
        let expected: Vec<u32> = (1..=granted.len() as u32).collect();
        prop_assert_eq!(granted, expected);
        prop_assert_eq!(budget.snapshot().consumed, attempts.min(ceiling as usize) as u32);
    }
}
