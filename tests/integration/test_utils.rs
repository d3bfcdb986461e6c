//! Shared fixtures for integration tests: a sled store in a temp dir, the
//! in-memory CRM, and a job manager wired to both.

use crmsim::content::TemplateContent;
use crmsim::crm::StubCrm;
use crmsim::plan::{RecordDistribution, SimulationConfig};
use crmsim::scheduler::{JobManager, ManagerSettings, Pacing};
use crmsim::store::{ProgressStore, SledProgressStore};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

/// Serializes tests that mutate process environment variables.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SledProgressStore>,
    pub stub: Arc<StubCrm>,
    pub manager: JobManager,
}

/// Immediate pacing, fixed seed, default association rules.
pub fn settings() -> ManagerSettings {
    let mut settings = ManagerSettings::default();
    settings.scheduler.pacing = Pacing::Immediate;
    settings.plan.seed = Some(42);
    settings.credential_key = "test-portal".to_string();
    settings
}

impl Harness {
    pub fn new(settings: ManagerSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SledProgressStore::open(dir.path().join("store")).unwrap());
        let stub = Arc::new(StubCrm::new());
        let manager = manager_over(&store, &stub, settings);
        Self {
            dir,
            store,
            stub,
            manager,
        }
    }

    /// A second manager over the same store and CRM, as after a restart.
    pub fn restarted(&self, settings: ManagerSettings) -> JobManager {
        manager_over(&self.store, &self.stub, settings)
    }
}

pub fn manager_over(
    store: &Arc<SledProgressStore>,
    stub: &Arc<StubCrm>,
    settings: ManagerSettings,
) -> JobManager {
    let store: Arc<dyn ProgressStore> = store.clone();
    JobManager::new(
        store,
        stub.clone(),
        Arc::new(TemplateContent::default()),
        settings,
    )
}

pub fn sim(contacts: i64, companies: i64, deals: i64, tickets: i64, notes: i64) -> SimulationConfig {
    SimulationConfig {
        theme: "Space Pirates".to_string(),
        industry: "Logistics".to_string(),
        duration_days: 7.0,
        record_distribution: RecordDistribution {
            contacts,
            companies,
            deals,
            tickets,
            notes,
            ..Default::default()
        },
    }
}

impl Harness {
    pub fn store_steps(&self, job_id: &crmsim::types::JobId) -> Vec<crmsim::plan::Step> {
        self.store.load_steps(job_id).unwrap()
    }
}
