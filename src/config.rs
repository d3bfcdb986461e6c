//! Configuration System
//!
//! Layered configuration: built-in defaults, the global user file, workspace
//! files, then `CRMSIM__*` environment variables. Each section validates itself;
//! [`SimConfig::validate`] collects every failure instead of stopping at the first.

use crate::crm::http::CrmSettings;
use crate::executor::{RateLimitSettings, RetryPolicy};
use crate::logging::LoggingConfig;
use crate::plan::PlanSettings;
use crate::scheduler::{ManagerSettings, SchedulerSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub crm: CrmSettings,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub plan: PlanSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the progress store lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled directory. Relative paths resolve under the workspace root.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve(&self, workspace_root: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => workspace_root.join(path),
            None => directories::ProjectDirs::from("", "", "crmsim")
                .map(|dirs| dirs.data_dir().join("store"))
                .unwrap_or_else(|| workspace_root.join(".crmsim").join("store")),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub section: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.section, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl SimConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let checks: [(&'static str, Result<(), String>); 6] = [
            ("crm", self.crm.validate()),
            ("rate_limit", self.rate_limit.validate()),
            ("retry", self.retry.validate()),
            ("plan", self.plan.validate()),
            ("scheduler", self.scheduler.validate()),
            ("logging", self.logging.validate()),
        ];
        let errors: Vec<ValidationError> = checks
            .into_iter()
            .filter_map(|(section, result)| {
                result.err().map(|message| ValidationError { section, message })
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            plan: self.plan.clone(),
            scheduler: self.scheduler.clone(),
            retry: self.retry.clone(),
            rate_limit: self.rate_limit.clone(),
            credential_key: self.crm.credential_key(),
        }
    }
}
