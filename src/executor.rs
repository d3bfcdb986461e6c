//! Rate-Limited Executor
//!
//! Issues one resolved [`Operation`] against the CRM. Every attempt first takes
//! a call from the shared [`RateBudget`]. Transient failures are retried with
//! exponential backoff, permanent and unsupported failures are returned at once,
//! and cancellation interrupts budget and backoff waits.

pub mod backoff;
pub mod batch;
pub mod budget;

pub use backoff::RetryPolicy;
pub use batch::{coalesce, Dispatch};
pub use budget::{BudgetScope, RateBudget, RateBudgets, RateLimitSettings};

use crate::crm::{
    AssociationRequest, CrmClient, CrmError, CrmErrorKind, FailureClass, FieldMap, RecordUpdate,
};
use crate::types::{RecordId, RecordType};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A wire-ready CRM call. Contains real identifiers only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create {
        record_type: RecordType,
        fields: FieldMap,
    },
    Associate(AssociationRequest),
    Update {
        record_type: RecordType,
        updates: Vec<RecordUpdate>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Associate(_) => "associate",
            Operation::Update { .. } => "update",
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Operation::Create { record_type, .. } | Operation::Update { record_type, .. } => {
                *record_type
            }
            Operation::Associate(request) => request.from_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Created(RecordId),
    Associated(usize),
    Updated(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub output: OperationOutput,
    pub attempts: u32,
}

/// Classified outcome of an operation that did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepFailure {
    #[error("{kind} error after {attempts} attempt(s): {message}")]
    Permanent {
        kind: CrmErrorKind,
        message: String,
        attempts: u32,
    },

    #[error("unsupported by the CRM: {message}")]
    Unsupported { message: String, attempts: u32 },

    #[error("gave up after {attempts} attempts, last {kind} error: {message}")]
    RetriesExhausted {
        kind: CrmErrorKind,
        message: String,
        attempts: u32,
    },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl StepFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            StepFailure::Permanent { attempts, .. }
            | StepFailure::Unsupported { attempts, .. }
            | StepFailure::RetriesExhausted { attempts, .. }
            | StepFailure::Cancelled { attempts } => *attempts,
        }
    }

    pub fn kind(&self) -> Option<CrmErrorKind> {
        match self {
            StepFailure::Permanent { kind, .. } | StepFailure::RetriesExhausted { kind, .. } => {
                Some(*kind)
            }
            StepFailure::Unsupported { .. } => Some(CrmErrorKind::UnknownObjectType),
            StepFailure::Cancelled { .. } => None,
        }
    }
}

/// Progress of one execution between attempts.
#[derive(Debug, Clone, Copy)]
pub enum AttemptEvent<'a> {
    /// A transient failure; the call is retried after backoff.
    Retrying { attempt: u32, error: &'a CrmError },
    /// A retry has its budget call and is being sent.
    Resent { attempt: u32 },
}

pub struct Executor {
    client: Arc<dyn CrmClient>,
    budget: Arc<RateBudget>,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(client: Arc<dyn CrmClient>, budget: Arc<RateBudget>, retry: RetryPolicy) -> Self {
        Self {
            client,
            budget,
            retry,
        }
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    /// Run `operation` to a classified outcome.
    ///
    /// `observe` hears about every transient failure that will be retried
    /// and every retry as it is sent. An association the client splits into
    /// several calls runs its parts in order; each part takes its own budget
    /// call and retries on its own, and attempts add up across parts.
    pub async fn execute<F>(
        &self,
        operation: &Operation,
        cancel: &CancellationToken,
        observe: F,
    ) -> Result<Execution, StepFailure>
    where
        F: Fn(AttemptEvent<'_>) + Send + Sync,
    {
        let Operation::Associate(request) = operation else {
            return self.run(operation, cancel, &observe, 0).await;
        };
        let parts = self.client.association_parts(request);
        if parts.len() <= 1 {
            return self.run(operation, cancel, &observe, 0).await;
        }
        let mut attempts = 0;
        let mut linked = 0;
        for part in parts {
            let done = self
                .run(&Operation::Associate(part), cancel, &observe, attempts)
                .await?;
            attempts = done.attempts;
            if let OperationOutput::Associated(n) = done.output {
                linked += n;
            }
        }
        Ok(Execution {
            output: OperationOutput::Associated(linked),
            attempts,
        })
    }

    /// One CRM call with budget and retries. `prior` attempts were spent on
    /// earlier parts of the same step.
    async fn run<F>(
        &self,
        operation: &Operation,
        cancel: &CancellationToken,
        observe: &F,
        prior: u32,
    ) -> Result<Execution, StepFailure>
    where
        F: Fn(AttemptEvent<'_>) + Send + Sync,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut tries = 0u32;
        loop {
            let attempts = prior + tries;
            if cancel.is_cancelled() {
                return Err(StepFailure::Cancelled { attempts });
            }
            let grant = self
                .budget
                .acquire(cancel)
                .await
                .map_err(|_| StepFailure::Cancelled { attempts })?;
            tries += 1;
            let attempts = prior + tries;
            debug!(
                op = operation.name(),
                record_type = %operation.record_type(),
                attempt = attempts,
                window_ordinal = grant.ordinal,
                "Dispatching CRM call"
            );
            if tries > 1 {
                observe(AttemptEvent::Resent { attempt: attempts });
            }

            let error = match self.call(operation).await {
                Ok(output) => return Ok(Execution { output, attempts }),
                Err(error) => error,
            };

            match error.class() {
                FailureClass::Unsupported => {
                    return Err(StepFailure::Unsupported {
                        message: error.message,
                        attempts,
                    })
                }
                FailureClass::Permanent => {
                    return Err(StepFailure::Permanent {
                        kind: error.kind,
                        message: error.message,
                        attempts,
                    })
                }
                FailureClass::Transient if tries >= max_attempts => {
                    warn!(
                        op = operation.name(),
                        attempts,
                        error = %error,
                        "CRM call failed, retries exhausted"
                    );
                    return Err(StepFailure::RetriesExhausted {
                        kind: error.kind,
                        message: error.message,
                        attempts,
                    });
                }
                FailureClass::Transient => {
                    let mut delay = self.retry.delay_for(tries);
                    if let Some(requested) = error.retry_after {
                        delay = delay.max(requested);
                    }
                    warn!(
                        op = operation.name(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient CRM failure, retrying"
                    );
                    observe(AttemptEvent::Retrying {
                        attempt: attempts,
                        error: &error,
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StepFailure::Cancelled { attempts }),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn call(&self, operation: &Operation) -> Result<OperationOutput, CrmError> {
        match operation {
            Operation::Create {
                record_type,
                fields,
            } => self
                .client
                .create_record(*record_type, fields)
                .await
                .map(OperationOutput::Created),
            Operation::Associate(request) => self
                .client
                .create_associations(request)
                .await
                .map(OperationOutput::Associated),
            Operation::Update {
                record_type,
                updates,
            } => self
                .client
                .update_records(*record_type, updates)
                .await
                .map(OperationOutput::Updated),
        }
    }
}
