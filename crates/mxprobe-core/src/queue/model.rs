//! Job envelopes and their lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::{BatchResult, ProbeResult};
use crate::sharding::domain_of;
use crate::{Error, Result};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generates a process-unique request id.
#[must_use]
pub fn next_request_id(prefix: &str) -> String {
    let seq = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{:x}-{seq:x}", Utc::now().timestamp_millis())
}

/// A single-address probe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeJob {
    /// Address to probe.
    pub email: String,
    /// Its normalized domain.
    pub domain: String,
    /// Id used for status queries and progress events.
    pub request_id: String,
    /// Caller-supplied tag, passed through untouched.
    pub client_id: Option<String>,
}

impl ProbeJob {
    /// Creates a job with a fresh request id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEmail`] if `email` has no usable domain.
    pub fn new(email: impl Into<String>, client_id: Option<String>) -> Result<Self> {
        let email = email.into();
        let domain = domain_of(&email)?;
        Ok(Self {
            email,
            domain,
            request_id: next_request_id("probe"),
            client_id,
        })
    }
}

/// A batch probe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Id used for status queries and progress events.
    pub batch_id: String,
    /// Addresses to probe.
    pub emails: Vec<String>,
    /// Caller-supplied tag, passed through untouched.
    pub client_id: Option<String>,
}

impl BatchJob {
    /// Creates a job with a fresh batch id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyBatch`] if `emails` is empty.
    pub fn new(emails: Vec<String>, client_id: Option<String>) -> Result<Self> {
        if emails.is_empty() {
            return Err(Error::EmptyBatch);
        }
        Ok(Self {
            batch_id: next_request_id("batch"),
            emails,
            client_id,
        })
    }
}

/// Lifecycle of a queued job.
///
/// `waiting -> active -> completed | failed`, or `waiting -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, not picked up yet.
    Waiting,
    /// A worker is running it.
    Active,
    /// Finished with a result.
    Completed,
    /// The worker died while running it.
    Failed,
    /// Cancelled before it started.
    Cancelled,
}

impl JobStatus {
    /// Returns true once the job will not change again.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Result of a [`ProbeJob`].
    Single(ProbeResult),
    /// Result of a [`BatchJob`].
    Batch(BatchResult),
}

/// Status and, once finished, outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Request or batch id.
    pub request_id: String,
    /// Caller-supplied tag.
    pub client_id: Option<String>,
    /// Current state.
    pub status: JobStatus,
    /// Outcome, for completed jobs.
    pub result: Option<JobOutcome>,
    /// Failure description, for failed jobs.
    pub error: Option<String>,
    /// When the job was accepted.
    pub submitted_at: DateTime<Utc>,
    /// When a worker picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a final state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    pub(crate) fn waiting(request_id: &str, client_id: Option<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            client_id,
            status: JobStatus::Waiting,
            result: None,
            error: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs not started.
    pub waiting: usize,
    /// Jobs running.
    pub active: usize,
    /// Jobs finished with a result.
    pub completed: usize,
    /// Jobs whose worker died.
    pub failed: usize,
    /// Jobs cancelled before starting.
    pub cancelled: usize,
    /// Whether workers are paused.
    pub paused: bool,
}
