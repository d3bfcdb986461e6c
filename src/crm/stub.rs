//! In-memory CRM used for dry runs and tests.
//!
//! Records every call attempt, assigns sequential identifiers, and can be told
//! to fail specific record types, fail the next few calls, or hold one call in
//! flight until released.

use crate::crm::{
    AssociationRequest, CrmClient, CrmError, CrmErrorKind, FieldMap, RecordUpdate,
};
use crate::types::{RecordId, RecordType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone, PartialEq)]
pub enum CrmCall {
    Create {
        record_type: RecordType,
        fields: FieldMap,
        id: Option<RecordId>,
    },
    Associate(AssociationRequest),
    Update {
        record_type: RecordType,
        updates: Vec<RecordUpdate>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub call: CrmCall,
    pub error: Option<CrmErrorKind>,
}

pub struct StubCrm {
    next_id: AtomicU64,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: watch::Sender<usize>,
    held: watch::Sender<bool>,
    type_failures: Mutex<HashMap<RecordType, CrmErrorKind>>,
    scripted: Mutex<VecDeque<CrmError>>,
    hold_at: Mutex<Option<usize>>,
    release: Semaphore,
    latency: Option<Duration>,
}

impl Default for StubCrm {
    fn default() -> Self {
        Self::new()
    }
}

impl StubCrm {
    pub fn new() -> Self {
        let (call_count, _) = watch::channel(0usize);
        let (held, _) = watch::channel(false);
        Self {
            next_id: AtomicU64::new(1001),
            calls: Mutex::new(Vec::new()),
            call_count,
            held,
            type_failures: Mutex::new(HashMap::new()),
            scripted: Mutex::new(VecDeque::new()),
            hold_at: Mutex::new(None),
            release: Semaphore::new(0),
            latency: None,
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every create and update for `record_type` with `kind`.
    pub fn fail_type(&self, record_type: RecordType, kind: CrmErrorKind) {
        self.type_failures.lock().insert(record_type, kind);
    }

    /// Fail the next call with `error`. Queued errors apply in order.
    pub fn fail_next(&self, error: CrmError) {
        self.scripted.lock().push_back(error);
    }

    /// Hold the `ordinal`-th call (1-based) in flight until [`release_held`](Self::release_held).
    pub fn hold_call(&self, ordinal: usize) {
        *self.hold_at.lock() = Some(ordinal);
    }

    pub fn release_held(&self) {
        self.release.add_permits(1);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn association_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c.call, CrmCall::Associate(_)))
            .count()
    }

    pub fn created_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c.call, CrmCall::Create { id: Some(_), .. }))
            .count()
    }

    /// Resolve once at least `n` calls have been attempted.
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Resolve once the call selected by [`hold_call`](Self::hold_call) is being held.
    pub async fn wait_until_held(&self) {
        let mut rx = self.held.subscribe();
        let _ = rx.wait_for(|held| *held).await;
    }

    fn next_failure(&self, record_type: Option<RecordType>) -> Option<CrmError> {
        if let Some(err) = self.scripted.lock().pop_front() {
            return Some(err);
        }
        let kind = record_type.and_then(|t| self.type_failures.lock().get(&t).copied())?;
        let status = match kind {
            CrmErrorKind::RateLimited => 429,
            CrmErrorKind::Authentication => 401,
            CrmErrorKind::NotFound => 404,
            CrmErrorKind::Server => 500,
            _ => 400,
        };
        let message = match (kind, record_type) {
            (CrmErrorKind::UnknownObjectType, Some(t)) => {
                format!("Unknown object type: {}", t.object_type())
            }
            _ => format!("stub failure: {}", kind),
        };
        Some(CrmError {
            kind,
            status: Some(status),
            message,
            retry_after: None,
        })
    }

    async fn record(&self, call: CrmCall, failure: Option<CrmError>) -> Result<(), CrmError> {
        let ordinal = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                call,
                error: failure.as_ref().map(|e| e.kind),
            });
            calls.len()
        };
        self.call_count.send_replace(ordinal);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let hold = *self.hold_at.lock() == Some(ordinal);
        if hold {
            self.held.send_replace(true);
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CrmClient for StubCrm {
    async fn create_record(
        &self,
        record_type: RecordType,
        fields: &FieldMap,
    ) -> Result<RecordId, CrmError> {
        let failure = self.next_failure(Some(record_type));
        let id = failure
            .is_none()
            .then(|| RecordId::new(self.next_id.fetch_add(1, Ordering::Relaxed).to_string()));
        self.record(
            CrmCall::Create {
                record_type,
                fields: fields.clone(),
                id: id.clone(),
            },
            failure,
        )
        .await?;
        // Success always carries an id.
        Ok(id.unwrap_or_else(|| RecordId::new("0")))
    }

    async fn create_associations(&self, request: &AssociationRequest) -> Result<usize, CrmError> {
        let failure = self.next_failure(None);
        self.record(CrmCall::Associate(request.clone()), failure)
            .await?;
        Ok(request.inputs.len())
    }

    async fn update_records(
        &self,
        record_type: RecordType,
        updates: &[RecordUpdate],
    ) -> Result<usize, CrmError> {
        let failure = self.next_failure(Some(record_type));
        self.record(
            CrmCall::Update {
                record_type,
                updates: updates.to_vec(),
            },
            failure,
        )
        .await?;
        Ok(updates.len())
    }
}
