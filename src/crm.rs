//! External CRM boundary
//!
//! The engine issues three kinds of writes: single record creation, a batched
//! association call for one primary record, and batched record updates. Every
//! request type here carries real [`RecordId`]s only; placeholders never reach
//! this layer.

use crate::types::{RecordId, RecordType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub mod http;
pub mod stub;

pub use http::{CrmSettings, HttpCrmClient};
pub use stub::{CrmCall, StubCrm};

/// Field name to value map sent as record properties.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationInput {
    pub to_type: RecordType,
    pub to_id: RecordId,
    pub association_type: String,
}

/// One primary record and every target it is attached to in a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRequest {
    pub from_type: RecordType,
    pub from_id: RecordId,
    pub category: String,
    pub inputs: Vec<AssociationInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub id: RecordId,
    pub fields: FieldMap,
}

/// How the executor treats a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmErrorKind {
    RateLimited,
    Timeout,
    Connection,
    Server,
    Validation,
    Authentication,
    UnknownObjectType,
    NotFound,
    Other,
}

impl CrmErrorKind {
    pub fn class(self) -> FailureClass {
        match self {
            CrmErrorKind::RateLimited
            | CrmErrorKind::Timeout
            | CrmErrorKind::Connection
            | CrmErrorKind::Server => FailureClass::Transient,
            CrmErrorKind::UnknownObjectType => FailureClass::Unsupported,
            CrmErrorKind::Validation
            | CrmErrorKind::Authentication
            | CrmErrorKind::NotFound
            | CrmErrorKind::Other => FailureClass::Permanent,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CrmErrorKind::RateLimited => "rate_limited",
            CrmErrorKind::Timeout => "timeout",
            CrmErrorKind::Connection => "connection",
            CrmErrorKind::Server => "server",
            CrmErrorKind::Validation => "validation",
            CrmErrorKind::Authentication => "authentication",
            CrmErrorKind::UnknownObjectType => "unknown_object_type",
            CrmErrorKind::NotFound => "not_found",
            CrmErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for CrmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one CRM call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} (status {status:?}): {message}")]
pub struct CrmError {
    pub kind: CrmErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-requested delay before the next attempt.
    pub retry_after: Option<Duration>,
}

impl CrmError {
    pub fn new(kind: CrmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify an HTTP error response.
    ///
    /// 429 and 5xx are transient, 401/403 are authentication failures, 404 is
    /// not-found, other 4xx are validation failures. A body naming an unknown
    /// object type overrides the status-based kind.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let kind = if mentions_unknown_object_type(body) {
            CrmErrorKind::UnknownObjectType
        } else {
            match status {
                429 => CrmErrorKind::RateLimited,
                401 | 403 => CrmErrorKind::Authentication,
                404 => CrmErrorKind::NotFound,
                408 => CrmErrorKind::Timeout,
                400..=499 => CrmErrorKind::Validation,
                500..=599 => CrmErrorKind::Server,
                _ => CrmErrorKind::Other,
            }
        };
        Self {
            kind,
            status: Some(status),
            message: body.to_string(),
            retry_after,
        }
    }

    pub fn class(&self) -> FailureClass {
        self.kind.class()
    }
}

fn mentions_unknown_object_type(body: &str) -> bool {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(category) = value.get("category").and_then(|c| c.as_str()) {
            if category.eq_ignore_ascii_case("OBJECT_TYPE_NOT_FOUND") {
                return true;
            }
        }
    }
    body.to_ascii_lowercase().contains("unknown object type")
}

/// Write surface of the external CRM.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Create one record and return the identifier the CRM assigned.
    async fn create_record(
        &self,
        record_type: RecordType,
        fields: &FieldMap,
    ) -> Result<RecordId, CrmError>;

    /// Attach every target in `request` to its primary record.
    async fn create_associations(&self, request: &AssociationRequest) -> Result<usize, CrmError>;

    /// Split an association request into the requests this CRM accepts in
    /// one call each. The default keeps the whole group in one call.
    fn association_parts(&self, request: &AssociationRequest) -> Vec<AssociationRequest> {
        vec![request.clone()]
    }

    /// Update several records of one type in one call.
    async fn update_records(
        &self,
        record_type: RecordType,
        updates: &[RecordUpdate],
    ) -> Result<usize, CrmError>;
}
