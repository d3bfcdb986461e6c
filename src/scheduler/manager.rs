//! Job control surface: start, pause, resume, stop, status, recovery.

use crate::content::ContentSource;
use crate::crm::CrmClient;
use crate::error::SimError;
use crate::executor::{Executor, RateBudgets, RateLimitSettings, RetryPolicy};
use crate::plan::{plan_digest, Plan, PlanBuilder, PlanSettings, SimulationConfig, Step};
use crate::resolver::ReferenceResolver;
use crate::scheduler::job::JobShared;
use crate::scheduler::{runner, SchedulerSettings, StatusReport};
use crate::store::{JobEvent, JobRecord, ProgressStore};
use crate::types::{now_millis, JobId, JobStatus, StepStatus};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the manager needs besides its collaborators.
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub plan: PlanSettings,
    pub scheduler: SchedulerSettings,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitSettings,
    /// Scope key of the CRM credential jobs run under.
    pub credential_key: String,
}

/// Outcome of [`JobManager::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: Vec<JobId>,
    /// Jobs left untouched, with the reason.
    pub rejected: Vec<(JobId, String)>,
}

pub struct JobManager {
    store: Arc<dyn ProgressStore>,
    client: Arc<dyn CrmClient>,
    content: Arc<dyn ContentSource>,
    settings: ManagerSettings,
    budgets: Arc<RateBudgets>,
    jobs: RwLock<HashMap<JobId, Arc<JobShared>>>,
    shutdown: CancellationToken,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        client: Arc<dyn CrmClient>,
        content: Arc<dyn ContentSource>,
        settings: ManagerSettings,
    ) -> Self {
        let budgets = Arc::new(RateBudgets::new(settings.rate_limit.clone()));
        Self {
            store,
            client,
            content,
            settings,
            budgets,
            jobs: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Share rate budgets with other managers in the same process.
    pub fn with_budgets(mut self, budgets: Arc<RateBudgets>) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn budgets(&self) -> &Arc<RateBudgets> {
        &self.budgets
    }

    /// Build the plan a job with `config` would run, without starting it.
    pub fn plan(&self, config: &SimulationConfig) -> Result<Plan, SimError> {
        PlanBuilder::new(&self.settings.plan, self.content.as_ref()).build(config)
    }

    /// Plan, persist, and start a job. Must be called inside a tokio runtime.
    pub fn start_job(&self, owner: &str, config: SimulationConfig) -> Result<JobId, SimError> {
        let handle = runtime()?;
        let plan = self.plan(&config)?;
        let job_id = JobId::generate();
        let now = now_millis();
        let record = JobRecord {
            job_id: job_id.clone(),
            owner: owner.to_string(),
            config,
            status: JobStatus::Pending,
            created_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
            plan_digest: plan.digest(),
            duration_ms: plan.duration_ms,
            steps_total: plan.steps.len(),
            error: None,
            updated_at_ms: now,
        };
        self.store.put_steps(&job_id, &plan.steps)?;
        self.store.put_job(&record)?;
        info!(
            job_id = %job_id,
            owner,
            steps = plan.steps.len(),
            creates = plan.create_count(),
            associations = plan.associate_count(),
            "Job created"
        );

        let shared = Arc::new(JobShared::new(
            record,
            plan.steps,
            ReferenceResolver::new(),
            Arc::clone(&self.store),
            self.shutdown.child_token(),
            self.settings.scheduler.pacing,
        ));
        shared.emit(
            "job_created",
            json!({ "owner": owner, "steps_total": shared.report().steps_total }),
        );
        shared.start()?;
        self.jobs.write().insert(job_id.clone(), Arc::clone(&shared));
        self.spawn_runner(&handle, &shared);
        Ok(job_id)
    }

    pub fn pause_job(&self, job_id: &JobId) -> Result<JobStatus, SimError> {
        self.attach(job_id)?.pause()
    }

    /// Resume a paused job, or start a recovered job that never ran.
    pub fn resume_job(&self, job_id: &JobId) -> Result<JobStatus, SimError> {
        let handle = runtime()?;
        let shared = self.attach(job_id)?;
        let status = match shared.status() {
            JobStatus::Pending => {
                shared.start()?;
                JobStatus::Running
            }
            _ => shared.resume()?,
        };
        if !shared.runner_active() {
            self.spawn_runner(&handle, &shared);
        }
        Ok(status)
    }

    /// Stop a job. Works on jobs that are only in the store, too.
    pub fn stop_job(&self, job_id: &JobId) -> Result<JobStatus, SimError> {
        self.attach(job_id)?.stop()
    }

    pub fn get_status(&self, job_id: &JobId) -> Result<StatusReport, SimError> {
        if let Some(shared) = self.job(job_id) {
            return Ok(shared.report());
        }
        let record = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| SimError::JobNotFound(job_id.clone()))?;
        let steps = self.store.load_steps(job_id)?;
        Ok(StatusReport::from_parts(&record, &steps))
    }

    pub fn steps(&self, job_id: &JobId) -> Result<Vec<Step>, SimError> {
        if let Some(shared) = self.job(job_id) {
            return Ok(shared.steps());
        }
        if self.store.get_job(job_id)?.is_none() {
            return Err(SimError::JobNotFound(job_id.clone()));
        }
        Ok(self.store.load_steps(job_id)?)
    }

    /// All persisted jobs, newest first.
    pub fn list_jobs(&self) -> Result<Vec<JobRecord>, SimError> {
        Ok(self.store.list_jobs()?)
    }

    pub fn events(&self, job_id: &JobId, after_seq: u64) -> Result<Vec<JobEvent>, SimError> {
        Ok(self.store.read_events(job_id, after_seq)?)
    }

    /// Load every non-terminal job from the store. Interrupted jobs come back
    /// paused; call [`JobManager::resume_job`] to continue them.
    pub fn recover(&self) -> Result<RecoveryReport, SimError> {
        let mut report = RecoveryReport::default();
        for record in self.store.list_jobs()? {
            if record.status.is_terminal() || self.job(&record.job_id).is_some() {
                continue;
            }
            let job_id = record.job_id.clone();
            match self.load_job(record) {
                Ok(shared) => {
                    self.jobs.write().insert(job_id.clone(), shared);
                    report.recovered.push(job_id);
                }
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "Job not recovered");
                    report.rejected.push((job_id, err.to_string()));
                }
            }
        }
        info!(
            recovered = report.recovered.len(),
            rejected = report.rejected.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    /// Wait until no runner is driving the job, then report its status.
    pub async fn wait(&self, job_id: &JobId) -> Result<StatusReport, SimError> {
        let Some(shared) = self.job(job_id) else {
            return self.get_status(job_id);
        };
        let mut changes = shared.subscribe();
        loop {
            if !shared.runner_active() {
                return Ok(shared.report());
            }
            if changes.changed().await.is_err() {
                return Ok(shared.report());
            }
        }
    }

    /// Wait until `done` holds for the job's status.
    pub async fn wait_until<F>(&self, job_id: &JobId, done: F) -> Result<StatusReport, SimError>
    where
        F: Fn(&StatusReport) -> bool,
    {
        let shared = self
            .job(job_id)
            .ok_or_else(|| SimError::JobNotFound(job_id.clone()))?;
        let mut changes = shared.subscribe();
        loop {
            let report = shared.report();
            if done(&report) {
                return Ok(report);
            }
            if changes.changed().await.is_err() {
                return Ok(shared.report());
            }
        }
    }

    /// Cancel every runner, wait for in-flight calls, and flush the store.
    /// Jobs keep their persisted status.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .jobs
            .read()
            .values()
            .filter_map(|shared| shared.runner.lock().take())
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Job runner ended abnormally");
            }
        }
        if let Err(err) = self.store.flush() {
            warn!(error = %err, "Failed to flush progress store");
        }
    }

    fn job(&self, job_id: &JobId) -> Option<Arc<JobShared>> {
        self.jobs.read().get(job_id).cloned()
    }

    fn attach(&self, job_id: &JobId) -> Result<Arc<JobShared>, SimError> {
        if let Some(shared) = self.job(job_id) {
            return Ok(shared);
        }
        let record = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| SimError::JobNotFound(job_id.clone()))?;
        let shared = self.load_job(record)?;
        let mut jobs = self.jobs.write();
        Ok(Arc::clone(jobs.entry(job_id.clone()).or_insert(shared)))
    }

    fn load_job(&self, mut record: JobRecord) -> Result<Arc<JobShared>, SimError> {
        let job_id = record.job_id.clone();
        let mut steps = self.store.load_steps(&job_id)?;
        if steps.len() != record.steps_total
            || steps.iter().enumerate().any(|(i, s)| s.seq as usize != i)
        {
            return Err(SimError::PlanIntegrity(format!(
                "job {} has {} persisted steps, expected {}",
                job_id,
                steps.len(),
                record.steps_total
            )));
        }
        let digest = plan_digest(&steps);
        if digest != record.plan_digest {
            return Err(SimError::PlanIntegrity(format!(
                "job {} plan digest {} does not match recorded {}",
                job_id, digest, record.plan_digest
            )));
        }

        let now = now_millis();
        let mut requeued = Vec::new();
        for step in steps.iter_mut() {
            if matches!(step.status, StepStatus::InFlight | StepStatus::FailedRetryable) {
                step.status = StepStatus::Pending;
                step.updated_at_ms = now;
                requeued.push(step.clone());
            }
        }
        if !requeued.is_empty() {
            self.store.put_steps(&job_id, &requeued)?;
        }

        let interrupted = record.status == JobStatus::Running;
        if interrupted {
            record.status = JobStatus::Paused;
            record.updated_at_ms = now;
            self.store.put_job(&record)?;
        }

        let resolver = ReferenceResolver::from_entries(steps.iter().filter_map(|step| {
            match (step.status, step.creates(), &step.real_id) {
                (StepStatus::Succeeded, Some(placeholder), Some(id)) => {
                    Some((placeholder.clone(), id.clone()))
                }
                _ => None,
            }
        }))?;
        info!(
            job_id = %job_id,
            status = %record.status,
            requeued = requeued.len(),
            resolved = resolver.len(),
            "Job loaded from store"
        );

        let shared = Arc::new(JobShared::new(
            record,
            steps,
            resolver,
            Arc::clone(&self.store),
            self.shutdown.child_token(),
            self.settings.scheduler.pacing,
        ));
        if interrupted {
            shared.emit(
                "job_paused",
                json!({ "reason": "interrupted", "requeued": requeued.len() }),
            );
        }
        Ok(shared)
    }

    fn spawn_runner(&self, handle: &Handle, shared: &Arc<JobShared>) {
        let budget = self
            .budgets
            .for_job(&self.settings.credential_key, shared.job_id().as_str());
        let executor = Arc::new(Executor::new(
            Arc::clone(&self.client),
            budget,
            self.settings.retry.clone(),
        ));
        shared.set_runner_active(true);
        let task = handle.spawn(runner::run_job(
            Arc::clone(shared),
            executor,
            self.settings.scheduler.clone(),
        ));
        *shared.runner.lock() = Some(task);
    }
}

fn runtime() -> Result<Handle, SimError> {
    Handle::try_current().map_err(|_| {
        SimError::InvalidConfiguration("job control requires a running tokio runtime".to_string())
    })
}
