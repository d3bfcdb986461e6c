//! Rate Budget: a fixed-window call allowance shared by every execution that
//! uses the same scope key.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which executions share one budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// One budget per CRM credential, shared by every job in the process.
    #[default]
    Credential,
    /// One budget for the whole process.
    Process,
    /// An independent budget per job.
    Job,
}

/// The `rate_limit` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_ceiling")]
    pub ceiling: u32,
    #[serde(default)]
    pub scope: BudgetScope,
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_ceiling() -> u32 {
    100
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            ceiling: default_ceiling(),
            scope: BudgetScope::default(),
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.window_ms == 0 {
            return Err("window_ms must be greater than zero".to_string());
        }
        if self.ceiling == 0 {
            return Err("ceiling must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetGrant {
    pub window_start: Instant,
    /// 1-based position of this call within its window.
    pub ordinal: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub window: Duration,
    pub ceiling: u32,
    pub consumed: u32,
    pub resets_in: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("rate budget wait cancelled")]
pub struct WaitCancelled;

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    consumed: u32,
}

#[derive(Debug)]
pub struct RateBudget {
    window: Duration,
    ceiling: u32,
    state: Mutex<WindowState>,
}

impl RateBudget {
    pub fn new(window: Duration, ceiling: u32) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            ceiling: ceiling.max(1),
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                consumed: 0,
            }),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(Duration::from_millis(settings.window_ms), settings.ceiling)
    }

    fn roll(&self, state: &mut WindowState, now: Instant) {
        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.consumed = 0;
        }
    }

    /// Take one call from the current window, or report how long until it resets.
    pub fn try_acquire(&self) -> Result<BudgetGrant, Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        if state.consumed < self.ceiling {
            state.consumed += 1;
            Ok(BudgetGrant {
                window_start: state.window_start,
                ordinal: state.consumed,
            })
        } else {
            let elapsed = now.duration_since(state.window_start);
            Err(self.window.saturating_sub(elapsed).max(Duration::from_millis(1)))
        }
    }

    /// Wait until the budget grants a call. Only `cancel` interrupts the wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BudgetGrant, WaitCancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }
            match self.try_acquire() {
                Ok(grant) => return Ok(grant),
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate budget exhausted, waiting for window reset");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(WaitCancelled),
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        BudgetSnapshot {
            window: self.window,
            ceiling: self.ceiling,
            consumed: state.consumed,
            resets_in: self
                .window
                .saturating_sub(now.duration_since(state.window_start)),
        }
    }
}

/// Registry handing out shared budgets by scope key.
#[derive(Debug)]
pub struct RateBudgets {
    settings: RateLimitSettings,
    budgets: Mutex<HashMap<String, Arc<RateBudget>>>,
}

impl RateBudgets {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> BudgetScope {
        self.settings.scope
    }

    /// Budget shared by every caller using `key`.
    pub fn budget_for(&self, key: &str) -> Arc<RateBudget> {
        self.budgets
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateBudget::from_settings(&self.settings)))
            .clone()
    }

    /// Budget for one job under the configured scope.
    pub fn for_job(&self, credential_key: &str, job_id: &str) -> Arc<RateBudget> {
        let budget = match self.settings.scope {
            BudgetScope::Credential => self.budget_for(&format!("credential:{}", credential_key)),
            BudgetScope::Process => self.budget_for("process"),
            BudgetScope::Job => Arc::new(RateBudget::from_settings(&self.settings)),
        };
        debug!(
            job_id,
            scope = ?self.settings.scope,
            ceiling = budget.ceiling,
            window_ms = budget.window.as_millis() as u64,
            "Rate budget attached"
        );
        budget
    }
}
