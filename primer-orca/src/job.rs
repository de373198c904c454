use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use uuid::Uuid;

use crate::params::JobParameters;

/// Unique identifier for a submitted job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque identifier correlating a job with its queued or executing task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskHandle(pub Uuid);

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::str::FromStr for TaskHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one execution attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The representative sequence set a job searches against.
///
/// Only the on-disk location matters to the orchestrator; the file itself
/// is managed by whoever accepted the upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceSetRef {
    pub id: i64,
    pub path: PathBuf,
}

/// The initial primer pairs a job starts from, stored inline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrimerPairsRef {
    pub id: i64,
    pub content: String,
}

/// A user-submitted unit of primer-optimization work.
///
/// Completion is not a field: a job is completed exactly when a
/// [`JobResult`](crate::result::JobResult) exists for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub is_public: bool,
    pub parameters: JobParameters,
    pub task_handle: Option<TaskHandle>,
    pub sequence_set: SequenceSetRef,
    pub primer_pairs: PrimerPairsRef,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        owner: impl Into<String>,
        parameters: JobParameters,
        sequence_set: SequenceSetRef,
        primer_pairs: PrimerPairsRef,
    ) -> Self {
        Self {
            id: JobId::new(),
            owner: owner.into(),
            is_public: false,
            parameters,
            task_handle: None,
            sequence_set,
            primer_pairs,
            created_at: Utc::now(),
        }
    }

    pub fn with_visibility(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    /// Number of independent optimization runs the job asked for.
    pub fn desired_runs(&self) -> i64 {
        self.parameters.int("runs").unwrap_or(1)
    }

    /// Restart budget the job asked for, if declared.
    pub fn restarts(&self) -> Option<i64> {
        self.parameters.int("restarts")
    }
}

/// Externally visible job status, derived on read.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Completed,
    Running,
    Pending,
    PendingRetry,
    Failed,
    /// Task state the orchestrator has no mapping for, passed through as-is.
    Other(String),
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::Running => "running",
            JobStatus::Pending => "pending",
            JobStatus::PendingRetry => "pending retry",
            JobStatus::Failed => "failed",
            JobStatus::Other(raw) => raw,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
