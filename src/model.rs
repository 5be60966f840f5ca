//! Core data model.
//!
//! A task enters the queue as a [`Submission`], lives in the queue store as a
//! [`QueueEntry`] while pending or in progress, and ends up as exactly one
//! immutable [`ActivityRecord`] once it reaches a terminal outcome. Callers
//! only ever see [`TaskHandle`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a task that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::InProgress => "IN_PROGRESS",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(QueueStatus::Pending),
            "IN_PROGRESS" => Ok(QueueStatus::InProgress),
            _ => Err(Error::Other(format!("unknown queue status: {s}"))),
        }
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    Success,
    Failed,
    Canceled,
}

impl ActivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::Success => "SUCCESS",
            ActivityStatus::Failed => "FAILED",
            ActivityStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(ActivityStatus::Success),
            "FAILED" => Ok(ActivityStatus::Failed),
            "CANCELED" => Ok(ActivityStatus::Canceled),
            _ => Err(Error::Other(format!("unknown activity status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator views
// ---------------------------------------------------------------------------

/// A project or module a task can be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub uuid: String,
    pub organization_uuid: String,
    pub key: String,
    pub name: String,
}

/// The tenant owning components and tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub uuid: String,
    pub key: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// A request to enqueue a task. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub(crate) uuid: String,
    pub(crate) task_type: String,
    pub(crate) component_uuid: Option<String>,
    pub(crate) submitter_login: Option<String>,
}

impl Submission {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn component_uuid(&self) -> Option<&str> {
        self.component_uuid.as_deref()
    }

    pub fn submitter_login(&self) -> Option<&str> {
        self.submitter_login.as_deref()
    }
}

/// Builder for [`Submission`]. Obtain one from `CeQueue::prepare_submit`,
/// which assigns the uuid up front.
#[derive(Debug, Clone)]
pub struct SubmissionBuilder {
    uuid: String,
    task_type: Option<String>,
    component_uuid: Option<String>,
    submitter_login: Option<String>,
}

impl SubmissionBuilder {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            task_type: None,
            component_uuid: None,
            submitter_login: None,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn component_uuid(mut self, component_uuid: impl Into<String>) -> Self {
        self.component_uuid = Some(component_uuid.into());
        self
    }

    pub fn submitter_login(mut self, login: impl Into<String>) -> Self {
        self.submitter_login = Some(login.into());
        self
    }

    pub fn build(self) -> Result<Submission> {
        let task_type = match self.task_type {
            Some(t) if !t.is_empty() => t,
            _ => {
                return Err(Error::InvalidArgument(
                    "task type can't be empty".to_string(),
                ));
            }
        };
        if self.uuid.is_empty() {
            return Err(Error::InvalidArgument("uuid can't be empty".to_string()));
        }
        Ok(Submission {
            uuid: self.uuid,
            task_type,
            component_uuid: self.component_uuid,
            submitter_login: self.submitter_login,
        })
    }
}

// ---------------------------------------------------------------------------
// Queue store row
// ---------------------------------------------------------------------------

/// A task that has not reached a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub uuid: String,
    pub task_type: String,
    pub component_uuid: Option<String>,
    pub submitter_login: Option<String>,
    pub status: QueueStatus,

    /// Number of times this entry has been claimed. Only ever grows, by one
    /// per claim.
    pub execution_count: u32,

    /// Last worker that claimed the entry.
    pub worker_uuid: Option<String>,

    /// Time of the most recent claim.
    pub started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// A fresh pending entry for a submission.
    pub fn pending(submission: &Submission, now: DateTime<Utc>) -> Self {
        Self {
            uuid: submission.uuid.clone(),
            task_type: submission.task_type.clone(),
            component_uuid: submission.component_uuid.clone(),
            submitter_login: submission.submitter_login.clone(),
            status: QueueStatus::Pending,
            execution_count: 0,
            worker_uuid: None,
            started_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Activity store row
// ---------------------------------------------------------------------------

/// The archived outcome of a task. Never modified after insertion, except
/// for `is_last` being cleared when a newer record for the same component
/// arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub uuid: String,
    pub task_type: String,
    pub component_uuid: Option<String>,
    pub submitter_login: Option<String>,
    pub status: ActivityStatus,

    /// Copied verbatim from the queue entry.
    pub execution_count: u32,
    /// Copied verbatim from the queue entry.
    pub worker_uuid: Option<String>,

    pub analysis_uuid: Option<String>,
    pub error_message: Option<String>,
    pub error_stacktrace: Option<String>,

    /// Most recent outcome for its component.
    pub is_last: bool,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Archive `entry` with the given outcome.
    pub fn from_entry(
        entry: &QueueEntry,
        status: ActivityStatus,
        result: Option<&TaskResult>,
        error: Option<&TaskError>,
        now: DateTime<Utc>,
    ) -> Self {
        let execution_time_ms = entry
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0));
        Self {
            uuid: entry.uuid.clone(),
            task_type: entry.task_type.clone(),
            component_uuid: entry.component_uuid.clone(),
            submitter_login: entry.submitter_login.clone(),
            status,
            execution_count: entry.execution_count,
            worker_uuid: entry.worker_uuid.clone(),
            analysis_uuid: result.and_then(|r| r.analysis_uuid.clone()),
            error_message: error.map(|e| e.message.clone()),
            error_stacktrace: error.map(|e| e.stacktrace.clone()),
            is_last: true,
            submitted_at: entry.created_at,
            started_at: entry.started_at,
            executed_at: now,
            execution_time_ms,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles, results, errors
// ---------------------------------------------------------------------------

/// What callers get back from `submit` and `peek`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub organization_uuid: String,
    pub uuid: String,
    pub task_type: String,
    pub component_uuid: Option<String>,
    /// Present only when the component resolves.
    pub component_key: Option<String>,
    /// Present only when the component resolves.
    pub component_name: Option<String>,
    pub submitter_login: Option<String>,
}

/// Output of a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub analysis_uuid: Option<String>,
}

impl TaskResult {
    pub fn with_analysis(analysis_uuid: impl Into<String>) -> Self {
        Self {
            analysis_uuid: Some(analysis_uuid.into()),
        }
    }
}

/// Failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    /// Full textual trace.
    pub stacktrace: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: stacktrace.into(),
        }
    }

    /// Render an error and its whole `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let message = err.to_string();
        let mut stacktrace = message.clone();
        let mut source = err.source();
        while let Some(cause) = source {
            stacktrace.push_str("\nCaused by: ");
            stacktrace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message,
            stacktrace,
        }
    }
}
