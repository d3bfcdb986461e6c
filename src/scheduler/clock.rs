//! Maps plan offsets to wall time.
//!
//! Paused intervals are excluded, so a job resumed after an hour-long pause
//! picks up where it left off instead of releasing an hour of steps at once.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// How fast plan time runs relative to wall time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Every step is due as soon as its dependencies are met.
    Immediate,
    /// One plan millisecond per wall millisecond.
    #[default]
    RealTime,
    /// Plan time runs `factor` times faster than wall time.
    Compressed(f64),
}

impl Pacing {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Pacing::Compressed(factor) if !factor.is_finite() || *factor <= 0.0 => Err(format!(
                "compressed pacing factor must be positive, got {}",
                factor
            )),
            _ => Ok(()),
        }
    }

    fn factor(&self) -> Option<f64> {
        match self {
            Pacing::Immediate => None,
            Pacing::RealTime => Some(1.0),
            Pacing::Compressed(factor) => Some(*factor),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanClock {
    pacing: Pacing,
    base_offset_ms: u64,
    started: Instant,
    paused_total: Duration,
    paused_at: Option<Instant>,
}

impl PlanClock {
    /// Start counting at `base_offset_ms` of plan time. Restarted jobs pass the
    /// offset they had reached.
    pub fn new(pacing: Pacing, base_offset_ms: u64) -> Self {
        Self {
            pacing,
            base_offset_ms,
            started: Instant::now(),
            paused_total: Duration::ZERO,
            paused_at: None,
        }
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    fn active_elapsed(&self) -> Duration {
        let until = self.paused_at.unwrap_or_else(Instant::now);
        until
            .saturating_duration_since(self.started)
            .saturating_sub(self.paused_total)
    }

    /// Current plan time in milliseconds.
    pub fn plan_now_ms(&self) -> u64 {
        match self.pacing.factor() {
            None => u64::MAX,
            Some(factor) => {
                let scaled = self.active_elapsed().as_millis() as f64 * factor;
                self.base_offset_ms
                    .saturating_add(scaled.min(u64::MAX as f64) as u64)
            }
        }
    }

    pub fn is_due(&self, offset_ms: u64) -> bool {
        offset_ms <= self.plan_now_ms()
    }

    /// Wall time until `offset_ms` is due, or `None` if it already is.
    pub fn until_due(&self, offset_ms: u64) -> Option<Duration> {
        let now = self.plan_now_ms();
        if offset_ms <= now {
            return None;
        }
        let factor = self.pacing.factor()?;
        let wall_ms = ((offset_ms - now) as f64 / factor).ceil().max(1.0);
        Some(Duration::from_millis(wall_ms as u64))
    }
}
