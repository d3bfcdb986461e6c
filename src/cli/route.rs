//! CLI route: single route table and run context. Dispatches to the job
//! manager and presentation.

use crate::cli::parse::Commands;
use crate::cli::presentation::{format_events, format_jobs, format_plan, format_status};
use crate::config::{ConfigLoader, SimConfig};
use crate::content::TemplateContent;
use crate::crm::{CrmClient, HttpCrmClient, StubCrm};
use crate::error::SimError;
use crate::plan::SimulationConfig;
use crate::scheduler::{JobManager, Pacing, StatusReport};
use crate::store::{ProgressStore, SledProgressStore};
use crate::types::JobId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Runtime context for CLI execution: workspace, loaded config, and the
/// progress store.
pub struct RunContext {
    workspace_root: PathBuf,
    config: SimConfig,
    store: Arc<SledProgressStore>,
}

impl RunContext {
    /// Load configuration and open the progress store.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, SimError> {
        let config = match &config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(&workspace_root)?,
        };
        config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            SimError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;

        let store_path = config.storage.resolve(&workspace_root);
        std::fs::create_dir_all(&store_path)
            .map_err(|e| SimError::StorageError(crate::error::StorageError::IoError(e)))?;
        let store = Arc::new(SledProgressStore::open(&store_path)?);
        info!(store = %store_path.display(), "Progress store opened");

        Ok(Self {
            workspace_root,
            config,
            store,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> Result<String, SimError> {
        match command {
            Commands::Plan { input, format } => {
                let sim = read_simulation_config(input)?;
                let plan = self.manager(true, None)?.plan(&sim)?;
                format_plan(&plan, format)
            }
            Commands::Run {
                input,
                owner,
                dry_run,
                pacing,
                format,
            } => {
                let sim = read_simulation_config(input)?;
                let manager = self.manager(*dry_run, pacing.as_deref())?;
                let job_id = manager.start_job(owner, sim)?;
                info!(job_id = %job_id, dry_run, "Job started from CLI");
                let report = drive(&manager, &job_id).await?;
                format_status(&report, format)
            }
            Commands::Resume {
                job_id,
                dry_run,
                pacing,
                format,
            } => {
                let job_id = JobId::from(job_id.as_str());
                let manager = self.manager(*dry_run, pacing.as_deref())?;
                manager.resume_job(&job_id)?;
                let report = drive(&manager, &job_id).await?;
                format_status(&report, format)
            }
            Commands::Stop { job_id, format } => {
                let job_id = JobId::from(job_id.as_str());
                let manager = self.manager(true, None)?;
                manager.stop_job(&job_id)?;
                let report = manager.get_status(&job_id)?;
                self.store.flush()?;
                format_status(&report, format)
            }
            Commands::Status { job_id, format } => {
                let job_id = JobId::from(job_id.as_str());
                let report = self.manager(true, None)?.get_status(&job_id)?;
                format_status(&report, format)
            }
            Commands::Jobs { format } => {
                let jobs = self.manager(true, None)?.list_jobs()?;
                format_jobs(&jobs, format)
            }
            Commands::Config { format } => {
                let mut effective = self.config.clone();
                if effective.crm.access_token.is_some() {
                    effective.crm.access_token = Some("<redacted>".to_string());
                }
                if format == "json" {
                    Ok(serde_json::to_string_pretty(&effective)?)
                } else {
                    toml::to_string_pretty(&effective).map_err(|e| {
                        SimError::ConfigError(format!("Failed to render configuration: {}", e))
                    })
                }
            }
            Commands::Events {
                job_id,
                after,
                format,
            } => {
                let job_id = JobId::from(job_id.as_str());
                let manager = self.manager(true, None)?;
                manager.get_status(&job_id)?;
                let events = manager.events(&job_id, *after)?;
                format_events(&events, format)
            }
        }
    }

    /// Build a manager over the shared store. Read-only commands and dry runs
    /// use the in-memory CRM.
    fn manager(&self, dry_run: bool, pacing: Option<&str>) -> Result<JobManager, SimError> {
        let client: Arc<dyn CrmClient> = if dry_run {
            Arc::new(StubCrm::new())
        } else {
            if self.config.crm.access_token.is_none() {
                warn!("No CRM access token configured; set CRMSIM_CRM__ACCESS_TOKEN");
            }
            Arc::new(HttpCrmClient::new(&self.config.crm)?)
        };
        let mut settings = self.config.manager_settings();
        if let Some(pacing) = pacing {
            settings.scheduler.pacing = parse_pacing(pacing)?;
        }
        let store: Arc<dyn ProgressStore> = self.store.clone();
        Ok(JobManager::new(
            store,
            client,
            Arc::new(TemplateContent::default()),
            settings,
        ))
    }
}

/// Wait for the job to finish. Ctrl-C pauses it, lets in-flight calls settle,
/// and returns the paused status.
async fn drive(manager: &JobManager, job_id: &JobId) -> Result<StatusReport, SimError> {
    let outcome = tokio::select! {
        report = manager.wait(job_id) => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let report = match outcome {
        Some(report) => report?,
        None => {
            warn!(job_id = %job_id, "Interrupted; pausing job");
            match manager.pause_job(job_id) {
                Ok(_) | Err(SimError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
            manager.shutdown().await;
            return manager.get_status(job_id);
        }
    };
    manager.shutdown().await;
    Ok(report)
}

fn read_simulation_config(path: &Path) -> Result<SimulationConfig, SimError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SimError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        SimError::InvalidConfiguration(format!(
            "invalid simulation config {}: {}",
            path.display(),
            e
        ))
    })
}

fn parse_pacing(value: &str) -> Result<Pacing, SimError> {
    let pacing = match value {
        "immediate" => Pacing::Immediate,
        "real_time" | "realtime" => Pacing::RealTime,
        other => {
            let factor = other
                .strip_prefix("compressed:")
                .and_then(|f| f.parse::<f64>().ok())
                .ok_or_else(|| {
                    SimError::InvalidConfiguration(format!(
                        "unknown pacing '{}' (expected immediate, real_time, or compressed:<factor>)",
                        other
                    ))
                })?;
            Pacing::Compressed(factor)
        }
    };
    pacing.validate().map_err(SimError::InvalidConfiguration)?;
    Ok(pacing)
}
