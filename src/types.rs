//! Core identifiers and status enums shared by planning, resolution, execution
//! and persistence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static JOB_COUNTER: AtomicU64 = AtomicU64::new(1);

/// CRM record types the simulator knows how to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Contact,
    Company,
    Deal,
    Ticket,
    Note,
    Task,
}

impl RecordType {
    /// Planning order: referenced types come before the types that reference them.
    pub const ALL: [RecordType; 6] = [
        RecordType::Company,
        RecordType::Contact,
        RecordType::Deal,
        RecordType::Ticket,
        RecordType::Note,
        RecordType::Task,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Contact => "contact",
            RecordType::Company => "company",
            RecordType::Deal => "deal",
            RecordType::Ticket => "ticket",
            RecordType::Note => "note",
            RecordType::Task => "task",
        }
    }

    /// Object type segment used in CRM API paths.
    pub fn object_type(self) -> &'static str {
        match self {
            RecordType::Contact => "contacts",
            RecordType::Company => "companies",
            RecordType::Deal => "deals",
            RecordType::Ticket => "tickets",
            RecordType::Note => "notes",
            RecordType::Task => "tasks",
        }
    }

    /// Fields a content source must supply for a record of this type.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            RecordType::Contact => &["email"],
            RecordType::Company => &["name"],
            RecordType::Deal => &["dealname"],
            RecordType::Ticket => &["subject"],
            RecordType::Note => &["hs_note_body"],
            RecordType::Task => &["hs_task_subject"],
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    /// Accepts singular and plural names, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        RecordType::ALL
            .into_iter()
            .find(|t| lowered == t.as_str() || lowered == t.object_type())
            .ok_or_else(|| format!("unknown record type '{}'", s))
    }
}

/// Plan-time stand-in for a record's real identifier, formatted `<type>:<index>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Placeholder(String);

impl Placeholder {
    pub fn new(record_type: RecordType, index: u32) -> Self {
        Placeholder(format!("{}:{}", record_type.as_str(), index))
    }

    /// Parse the `<type>:<index>` form. Plural type names are not accepted here.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (kind, index) = s
            .split_once(':')
            .ok_or_else(|| format!("placeholder '{}' is missing ':'", s))?;
        let record_type = RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == kind)
            .ok_or_else(|| format!("placeholder '{}' names unknown type '{}'", s, kind))?;
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("placeholder '{}' has a non-numeric index", s));
        }
        let index: u32 = index
            .parse()
            .map_err(|e| format!("placeholder '{}' index out of range: {}", s, e))?;
        Ok(Placeholder::new(record_type, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn record_type(&self) -> RecordType {
        // Construction always goes through `new`, so the prefix is a known type.
        let kind = self.0.split(':').next().unwrap_or_default();
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == kind)
            .unwrap_or(RecordType::Contact)
    }

    /// Template token form embedded in free-text fields: `{{contact:0}}`.
    pub fn token(&self) -> String {
        format!("{{{{{}}}}}", self.0)
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Placeholder {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Placeholder::parse(&value)
    }
}

impl From<Placeholder> for String {
    fn from(value: Placeholder) -> Self {
        value.0
    }
}

/// Identifier assigned by the external CRM.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        let ts = now_millis();
        let pid = std::process::id();
        let seq = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
        JobId(format!("job-{ts}-{pid}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Completed | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InFlight => "in_flight",
            StepStatus::Succeeded => "succeeded",
            StepStatus::FailedRetryable => "failed_retryable",
            StepStatus::FailedPermanent => "failed_permanent",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::FailedPermanent | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
