//! Spread policies: where in `[0, duration)` each record of a type lands.

use crate::error::SimError;
use crate::types::RecordType;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadPolicy {
    /// Independent uniform jitter across the span.
    #[default]
    Uniform,
    /// Evenly spaced, centred in equal slots.
    Even,
    /// Weighted buckets from a per-type timing curve, uniform jitter within a bucket.
    Curve,
}

/// Offsets for `count` records, sorted ascending so lower indices happen first.
pub fn offsets(
    policy: SpreadPolicy,
    record_type: RecordType,
    count: u32,
    duration_ms: u64,
    curve: Option<&[f64]>,
    rng: &mut StdRng,
) -> Result<Vec<u64>, SimError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let mut out = match (policy, curve) {
        (SpreadPolicy::Even, _) => even(count, duration_ms),
        (SpreadPolicy::Curve, Some(weights)) => weighted(record_type, count, duration_ms, weights, rng)?,
        (SpreadPolicy::Uniform, _) | (SpreadPolicy::Curve, None) => {
            (0..count).map(|_| rng.gen_range(0..duration_ms)).collect()
        }
    };
    out.sort_unstable();
    Ok(out)
}

fn even(count: u32, duration_ms: u64) -> Vec<u64> {
    let d = duration_ms as u128;
    let n = count as u128;
    (0..n).map(|i| (d * (2 * i + 1) / (2 * n)) as u64).collect()
}

fn weighted(
    record_type: RecordType,
    count: u32,
    duration_ms: u64,
    weights: &[f64],
    rng: &mut StdRng,
) -> Result<Vec<u64>, SimError> {
    let dist = WeightedIndex::new(weights).map_err(|e| {
        SimError::InvalidConfiguration(format!(
            "timing curve for {} is unusable: {}",
            record_type, e
        ))
    })?;
    let buckets = weights.len() as u128;
    let d = duration_ms as u128;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bucket = dist.sample(rng) as u128;
        let start = (bucket * d / buckets) as u64;
        let end = (((bucket + 1) * d) / buckets) as u64;
        let offset = if end > start {
            rng.gen_range(start..end)
        } else {
            start
        };
        out.push(offset.min(duration_ms.saturating_sub(1)));
    }
    Ok(out)
}
