//! Per-job shared state: the job record, its steps, the placeholder map, and
//! every state transition. All mutation happens under one lock, and each
//! change is written to the progress store before it becomes visible.

use crate::crm::{CrmError, CrmErrorKind};
use crate::error::SimError;
use crate::executor::{coalesce, Dispatch, Execution, OperationOutput, StepFailure};
use crate::plan::{Step, StepKind};
use crate::resolver::ReferenceResolver;
use crate::scheduler::{Pacing, PlanClock, StatusReport};
use crate::store::{JobRecord, ProgressStore};
use crate::types::{now_millis, JobId, JobStatus, Placeholder, RecordType, StepStatus};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct JobState {
    record: JobRecord,
    steps: Vec<Step>,
    clock: PlanClock,
    producers: HashMap<Placeholder, usize>,
    /// Attempts a step had before its current dispatch.
    attempt_base: HashMap<u32, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DispatchKey {
    Single(u32),
    Association(Placeholder, String),
    Update(RecordType),
}

pub struct JobShared {
    job_id: JobId,
    state: Mutex<JobState>,
    resolver: ReferenceResolver,
    store: Arc<dyn ProgressStore>,
    cancel: CancellationToken,
    pub(crate) wake: Notify,
    signal: watch::Sender<u64>,
    runner_active: AtomicBool,
    pub(crate) runner: Mutex<Option<JoinHandle<()>>>,
}

impl JobShared {
    pub(crate) fn new(
        record: JobRecord,
        steps: Vec<Step>,
        resolver: ReferenceResolver,
        store: Arc<dyn ProgressStore>,
        cancel: CancellationToken,
        pacing: Pacing,
    ) -> Self {
        let producers = steps
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.creates().map(|p| (p.clone(), i)))
            .collect();
        // Restarted jobs continue from the furthest offset already settled.
        let base_offset = steps
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.offset_ms)
            .max()
            .unwrap_or(0);
        let mut clock = PlanClock::new(pacing, base_offset);
        if record.status == JobStatus::Paused {
            clock.pause();
        }
        let (signal, _) = watch::channel(0);
        Self {
            job_id: record.job_id.clone(),
            state: Mutex::new(JobState {
                record,
                steps,
                clock,
                producers,
                attempt_base: HashMap::new(),
            }),
            resolver,
            store,
            cancel,
            wake: Notify::new(),
            signal,
            runner_active: AtomicBool::new(false),
            runner: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().record.status
    }

    pub fn report(&self) -> StatusReport {
        let state = self.state.lock();
        StatusReport::from_parts(&state.record, &state.steps)
    }

    pub fn record(&self) -> JobRecord {
        self.state.lock().record.clone()
    }

    pub fn steps(&self) -> Vec<Step> {
        self.state.lock().steps.clone()
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    pub(crate) fn runner_active(&self) -> bool {
        self.runner_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_runner_active(&self, active: bool) {
        self.runner_active.store(active, Ordering::SeqCst);
        self.bump();
    }

    fn bump(&self) {
        self.signal.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Append to the job's event log. Failures are logged, not propagated.
    pub(crate) fn emit(&self, event_type: &str, data: serde_json::Value) {
        if let Err(err) = self.store.append_event(&self.job_id, event_type, data) {
            warn!(job_id = %self.job_id, event_type, error = %err, "Failed to append job event");
        }
    }

    fn persist_steps(&self, state: &JobState, seqs: &[u32]) {
        if seqs.is_empty() {
            return;
        }
        let changed: Vec<Step> = seqs
            .iter()
            .filter_map(|seq| state.steps.get(*seq as usize).cloned())
            .collect();
        if let Err(err) = self.store.put_steps(&self.job_id, &changed) {
            error!(job_id = %self.job_id, steps = changed.len(), error = %err, "Failed to persist step progress");
        }
    }

    fn persist_record(&self, record: &JobRecord) {
        if let Err(err) = self.store.put_job(record) {
            error!(job_id = %self.job_id, error = %err, "Failed to persist job record");
        }
    }

    fn invalid(&self, from: JobStatus, action: &'static str) -> SimError {
        SimError::InvalidTransition {
            job_id: self.job_id.clone(),
            from,
            action,
        }
    }

    /// `pending -> running`.
    pub fn start(&self) -> Result<(), SimError> {
        let mut state = self.state.lock();
        if state.record.status != JobStatus::Pending {
            return Err(self.invalid(state.record.status, "start"));
        }
        let mut next = state.record.clone();
        next.status = JobStatus::Running;
        next.started_at_ms = Some(now_millis());
        next.updated_at_ms = now_millis();
        self.store.put_job(&next)?;
        state.record = next;
        state.clock.resume();
        drop(state);
        info!(job_id = %self.job_id, "Job started");
        self.emit("job_started", json!({}));
        self.bump();
        self.wake.notify_one();
        Ok(())
    }

    /// `running -> paused`. In-flight calls finish; nothing new is dispatched.
    pub fn pause(&self) -> Result<JobStatus, SimError> {
        let mut state = self.state.lock();
        match state.record.status {
            JobStatus::Paused => return Ok(JobStatus::Paused),
            JobStatus::Running => {}
            other => return Err(self.invalid(other, "pause")),
        }
        let mut next = state.record.clone();
        next.status = JobStatus::Paused;
        next.updated_at_ms = now_millis();
        self.store.put_job(&next)?;
        state.record = next;
        state.clock.pause();
        drop(state);
        info!(job_id = %self.job_id, "Job paused");
        self.emit("job_paused", json!({}));
        self.bump();
        self.wake.notify_one();
        Ok(JobStatus::Paused)
    }

    /// `paused -> running`.
    pub fn resume(&self) -> Result<JobStatus, SimError> {
        let mut state = self.state.lock();
        match state.record.status {
            JobStatus::Running => return Ok(JobStatus::Running),
            JobStatus::Paused => {}
            other => return Err(self.invalid(other, "resume")),
        }
        let mut next = state.record.clone();
        next.status = JobStatus::Running;
        next.updated_at_ms = now_millis();
        self.store.put_job(&next)?;
        state.record = next;
        state.clock.resume();
        drop(state);
        info!(job_id = %self.job_id, "Job resumed");
        self.emit("job_resumed", json!({}));
        self.bump();
        self.wake.notify_one();
        Ok(JobStatus::Running)
    }

    /// Hard stop: every pending step is skipped and no further call is issued.
    /// Stopping a stopped job is a no-op.
    pub fn stop(&self) -> Result<JobStatus, SimError> {
        let mut state = self.state.lock();
        match state.record.status {
            JobStatus::Stopped => return Ok(JobStatus::Stopped),
            JobStatus::Running | JobStatus::Paused => {}
            other => return Err(self.invalid(other, "stop")),
        }
        let now = now_millis();
        let skipped = skip_pending(&mut state.steps, "job stopped", now);
        let changed: Vec<Step> = skipped
            .iter()
            .filter_map(|seq| state.steps.get(*seq as usize).cloned())
            .collect();
        let mut next = state.record.clone();
        next.status = JobStatus::Stopped;
        next.completed_at_ms = Some(now);
        next.updated_at_ms = now;
        self.store.put_steps(&self.job_id, &changed)?;
        self.store.put_job(&next)?;
        state.record = next;
        state.clock.pause();
        drop(state);
        self.cancel.cancel();
        info!(job_id = %self.job_id, skipped = skipped.len(), "Job stopped");
        self.emit("job_stopped", json!({ "skipped": skipped.len() }));
        self.bump();
        self.wake.notify_one();
        Ok(JobStatus::Stopped)
    }

    /// Skip pending steps whose dependency can no longer be produced.
    pub(crate) fn skip_unreachable(&self) -> usize {
        let mut state = self.state.lock();
        let now = now_millis();
        let mut changed = Vec::new();
        for i in 0..state.steps.len() {
            if state.steps[i].status != StepStatus::Pending {
                continue;
            }
            let mut reason = None;
            for dep in &state.steps[i].depends_on {
                if self.resolver.get(dep).is_some() {
                    continue;
                }
                match state.producers.get(dep).map(|&p| &state.steps[p]) {
                    Some(producer)
                        if matches!(
                            producer.status,
                            StepStatus::FailedPermanent | StepStatus::Skipped | StepStatus::Succeeded
                        ) =>
                    {
                        reason = Some(format!("dependency {} unavailable ({})", dep, producer.status));
                        break;
                    }
                    Some(_) => {}
                    None => {
                        reason = Some(format!("dependency {} has no producing step", dep));
                        break;
                    }
                }
            }
            if let Some(reason) = reason {
                let step = &mut state.steps[i];
                step.status = StepStatus::Skipped;
                step.last_error = Some(reason.clone());
                step.updated_at_ms = now;
                debug!(job_id = %self.job_id, seq = step.seq, reason = %reason, "Step skipped");
                changed.push(step.seq);
            }
        }
        self.persist_steps(&state, &changed);
        drop(state);
        for seq in &changed {
            self.emit("step_skipped", json!({ "seq": seq, "reason": "dependency_unavailable" }));
        }
        changed.len()
    }

    /// Pick up to `capacity` calls' worth of due, ready steps, coalesce them,
    /// and mark them in flight.
    pub(crate) fn take_ready(&self, capacity: usize, max_batch_size: usize) -> Vec<Dispatch> {
        if capacity == 0 {
            return Vec::new();
        }
        let mut state = self.state.lock();
        if state.record.status != JobStatus::Running {
            return Vec::new();
        }

        // Association groups go out together or not at all.
        let mut group_members: HashMap<(Placeholder, String), Vec<usize>> = HashMap::new();
        let mut group_blocked: HashSet<(Placeholder, String)> = HashSet::new();
        let mut dispatchable = Vec::new();
        for (i, step) in state.steps.iter().enumerate() {
            if step.status != StepStatus::Pending {
                continue;
            }
            let ok = state.clock.is_due(step.offset_ms) && self.resolver.is_ready(step);
            if let Some(key) = step.association_key() {
                group_members.entry(key.clone()).or_default().push(i);
                if !ok {
                    group_blocked.insert(key);
                }
            }
            if ok {
                dispatchable.push(i);
            }
        }

        let mut picked: Vec<usize> = Vec::new();
        let mut taken: HashSet<usize> = HashSet::new();
        let mut keys: HashSet<DispatchKey> = HashSet::new();
        for i in dispatchable {
            if taken.contains(&i) {
                continue;
            }
            let step = &state.steps[i];
            let key = match &step.kind {
                StepKind::Create { .. } => DispatchKey::Single(step.seq),
                StepKind::Associate { from, category, .. } => {
                    DispatchKey::Association(from.clone(), category.clone())
                }
                StepKind::Update { .. } => DispatchKey::Update(step.record_type()),
            };
            if let DispatchKey::Association(from, category) = &key {
                if group_blocked.contains(&(from.clone(), category.clone())) {
                    continue;
                }
            }
            if !keys.contains(&key) {
                if keys.len() >= capacity {
                    continue;
                }
                keys.insert(key.clone());
            }
            match &key {
                DispatchKey::Association(from, category) => {
                    let members = group_members
                        .get(&(from.clone(), category.clone()))
                        .cloned()
                        .unwrap_or_default();
                    for m in members {
                        if taken.insert(m) {
                            picked.push(m);
                        }
                    }
                }
                _ => {
                    taken.insert(i);
                    picked.push(i);
                }
            }
        }
        picked.sort_unstable();

        let now = now_millis();
        let mut items = Vec::with_capacity(picked.len());
        let mut defects = Vec::new();
        for i in picked {
            let step = &state.steps[i];
            match self.resolver.resolve(&step.kind) {
                Ok(operation) => items.push((step.seq, operation)),
                Err(err) => {
                    error!(job_id = %self.job_id, seq = step.seq, error = %err, "Step was ready but failed to resolve");
                    defects.push((i, err.to_string()));
                }
            }
        }
        let mut changed = Vec::new();
        for (i, message) in defects {
            let step = &mut state.steps[i];
            step.status = StepStatus::FailedPermanent;
            step.last_error = Some(message);
            step.updated_at_ms = now;
            changed.push(step.seq);
        }

        let mut dispatches = coalesce(items, max_batch_size);
        dispatches.truncate(capacity);
        for dispatch in &dispatches {
            for seq in &dispatch.seqs {
                let base = state.steps[*seq as usize].attempts;
                state.attempt_base.insert(*seq, base);
                let step = &mut state.steps[*seq as usize];
                step.status = StepStatus::InFlight;
                step.updated_at_ms = now;
                changed.push(*seq);
            }
        }
        self.persist_steps(&state, &changed);
        drop(state);

        for dispatch in &dispatches {
            debug!(
                job_id = %self.job_id,
                seqs = ?dispatch.seqs,
                op = dispatch.operation.name(),
                record_type = %dispatch.operation.record_type(),
                "Dispatching steps"
            );
            self.emit(
                "step_dispatched",
                json!({
                    "seqs": dispatch.seqs,
                    "op": dispatch.operation.name(),
                    "record_type": dispatch.operation.record_type(),
                }),
            );
        }
        if !changed.is_empty() {
            self.bump();
        }
        dispatches
    }

    /// Wall time until the next pending step falls due, if one is in the future.
    pub(crate) fn next_due_in(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter_map(|s| state.clock.until_due(s.offset_ms))
            .min()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.state
            .lock()
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Pending)
    }

    pub(crate) fn all_terminal(&self) -> bool {
        self.state.lock().steps.iter().all(Step::is_terminal)
    }

    /// Fail pending steps that can never become ready.
    pub(crate) fn fail_blocked(&self) -> usize {
        let mut state = self.state.lock();
        let now = now_millis();
        let mut changed = Vec::new();
        for step in state.steps.iter_mut() {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::FailedPermanent;
                step.last_error = Some("dependencies can never be resolved".to_string());
                step.updated_at_ms = now;
                changed.push(step.seq);
            }
        }
        self.persist_steps(&state, &changed);
        drop(state);
        if !changed.is_empty() {
            error!(job_id = %self.job_id, steps = changed.len(), "Pending steps are blocked on unresolvable dependencies");
            self.emit("step_failed", json!({ "seqs": changed, "error": "unresolvable_dependency" }));
            self.bump();
        }
        changed.len()
    }

    /// Record a transient failure that the executor is about to retry.
    pub(crate) fn mark_retrying(&self, seqs: &[u32], attempt: u32, err: &CrmError) {
        let mut state = self.state.lock();
        let now = now_millis();
        for seq in seqs {
            let base = state.attempt_base.get(seq).copied().unwrap_or(0);
            if let Some(step) = state.steps.get_mut(*seq as usize) {
                if step.status.is_terminal() {
                    continue;
                }
                step.status = StepStatus::FailedRetryable;
                step.attempts = base + attempt;
                step.last_error = Some(err.to_string());
                step.updated_at_ms = now;
            }
        }
        self.persist_steps(&state, seqs);
        drop(state);
        self.emit(
            "step_retrying",
            json!({ "seqs": seqs, "attempt": attempt, "kind": err.kind, "error": err.message }),
        );
    }

    /// A retry is back on the wire.
    pub(crate) fn mark_resent(&self, seqs: &[u32], attempt: u32) {
        let mut state = self.state.lock();
        let now = now_millis();
        let mut resent = Vec::new();
        for seq in seqs {
            let base = state.attempt_base.get(seq).copied().unwrap_or(0);
            if let Some(step) = state.steps.get_mut(*seq as usize) {
                if step.status != StepStatus::FailedRetryable {
                    continue;
                }
                step.status = StepStatus::InFlight;
                step.attempts = base + attempt;
                step.updated_at_ms = now;
                resent.push(*seq);
            }
        }
        if resent.is_empty() {
            return;
        }
        self.persist_steps(&state, &resent);
        drop(state);
        self.emit("step_resent", json!({ "seqs": resent, "attempt": attempt }));
    }

    /// Apply a finished dispatch to its steps.
    pub(crate) fn complete(
        &self,
        seqs: &[u32],
        result: Result<Execution, StepFailure>,
        fatal_errors: &[CrmErrorKind],
    ) {
        let mut state = self.state.lock();
        let now = now_millis();
        let mut events = Vec::new();
        let mut changed: Vec<u32> = seqs.to_vec();
        let mut fatal_message = None;

        match result {
            Ok(execution) => {
                for seq in seqs {
                    let base = state.attempt_base.remove(seq).unwrap_or(0);
                    let Some(step) = state.steps.get_mut(*seq as usize) else {
                        continue;
                    };
                    step.status = StepStatus::Succeeded;
                    step.attempts = base + execution.attempts;
                    step.last_error = None;
                    step.updated_at_ms = now;
                    if let OperationOutput::Created(id) = &execution.output {
                        step.real_id = Some(id.clone());
                        if let Some(placeholder) = step.creates().cloned() {
                            if let Err(err) = self.resolver.record(placeholder, id.clone()) {
                                error!(job_id = %self.job_id, seq, error = %err, "Created record could not be mapped");
                                step.status = StepStatus::FailedPermanent;
                                step.last_error = Some(err.to_string());
                            }
                        }
                    }
                    events.push((
                        if step.status == StepStatus::Succeeded {
                            "step_succeeded"
                        } else {
                            "step_failed"
                        },
                        json!({
                            "seq": seq,
                            "step": step.label(),
                            "attempts": step.attempts,
                            "id": step.real_id,
                        }),
                    ));
                }
            }
            Err(failure) => {
                let job_terminal = state.record.status.is_terminal();
                let (status, fatal) = match &failure {
                    StepFailure::Unsupported { .. } => (StepStatus::Skipped, false),
                    StepFailure::Permanent { kind, .. }
                    | StepFailure::RetriesExhausted { kind, .. } => {
                        (StepStatus::FailedPermanent, fatal_errors.contains(kind))
                    }
                    StepFailure::Cancelled { .. } if job_terminal => (StepStatus::Skipped, false),
                    StepFailure::Cancelled { .. } => (StepStatus::Pending, false),
                };
                for seq in seqs {
                    let base = state.attempt_base.remove(seq).unwrap_or(0);
                    let Some(step) = state.steps.get_mut(*seq as usize) else {
                        continue;
                    };
                    step.status = status;
                    step.attempts = base + failure.attempts();
                    step.last_error = Some(failure.to_string());
                    step.updated_at_ms = now;
                    if fatal && !job_terminal {
                        step.fatal = true;
                    }
                    match status {
                        StepStatus::Skipped => {
                            info!(job_id = %self.job_id, seq, reason = %failure, "Step skipped");
                            events.push((
                                "step_skipped",
                                json!({ "seq": seq, "step": step.label(), "reason": failure.to_string() }),
                            ));
                        }
                        StepStatus::FailedPermanent => {
                            warn!(job_id = %self.job_id, seq, error = %failure, "Step failed");
                            events.push((
                                "step_failed",
                                json!({
                                    "seq": seq,
                                    "step": step.label(),
                                    "kind": failure.kind(),
                                    "error": failure.to_string(),
                                    "fatal": step.fatal,
                                }),
                            ));
                        }
                        _ => {}
                    }
                }
                if fatal && !job_terminal {
                    fatal_message = Some(format!(
                        "aborted by fatal error on step {}: {}",
                        seqs.first().copied().unwrap_or_default(),
                        failure
                    ));
                }
            }
        }

        if let Some(message) = &fatal_message {
            changed.extend(skip_pending(&mut state.steps, "job failed", now));
            let mut next = state.record.clone();
            next.status = JobStatus::Failed;
            next.error = Some(message.clone());
            next.completed_at_ms = Some(now);
            next.updated_at_ms = now;
            self.persist_record(&next);
            state.record = next;
            state.clock.pause();
        }
        self.persist_steps(&state, &changed);
        drop(state);

        for (event_type, data) in events {
            self.emit(event_type, data);
        }
        if let Some(message) = fatal_message {
            error!(job_id = %self.job_id, error = %message, "Job failed");
            self.emit("job_failed", json!({ "error": message }));
            self.cancel.cancel();
        }
        self.bump();
    }

    /// Settle a running job whose steps are all terminal.
    pub(crate) fn finalize(&self) -> JobStatus {
        let mut state = self.state.lock();
        if state.record.status != JobStatus::Running
            || !state.steps.iter().all(Step::is_terminal)
        {
            return state.record.status;
        }
        let now = now_millis();
        let mut next = state.record.clone();
        next.status = if state.steps.iter().any(|s| s.fatal) {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        next.completed_at_ms = Some(now);
        next.updated_at_ms = now;
        self.persist_record(&next);
        state.record = next;
        let report = StatusReport::from_parts(&state.record, &state.steps);
        drop(state);

        info!(
            job_id = %self.job_id,
            status = %report.status,
            succeeded = report.steps_succeeded,
            failed = report.steps_failed,
            skipped = report.steps_skipped,
            "Job finished"
        );
        let event_type = if report.status == JobStatus::Completed {
            "job_completed"
        } else {
            "job_failed"
        };
        self.emit(
            event_type,
            json!({
                "succeeded": report.steps_succeeded,
                "failed": report.steps_failed,
                "skipped": report.steps_skipped,
            }),
        );
        self.bump();
        report.status
    }
}

fn skip_pending(steps: &mut [Step], reason: &str, now: u64) -> Vec<u32> {
    let mut skipped = Vec::new();
    for step in steps.iter_mut() {
        if step.status == StepStatus::Pending {
            step.status = StepStatus::Skipped;
            step.last_error = Some(reason.to_string());
            step.updated_at_ms = now;
            skipped.push(step.seq);
        }
    }
    skipped
}
