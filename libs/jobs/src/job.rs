//! Job records and their status model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;

/// Highest accepted job priority.
pub const MAX_PRIORITY: u8 = 10;

/// Lifecycle status of a job.
///
/// `Queued → Initializing → Running → {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        Self::Queued,
        Self::Initializing,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for statuses with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` follows the job state machine.
    ///
    /// The queue does not enforce this; submission and cancellation paths
    /// call it before asking for a transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Initializing) => true,
            (Initializing, Running) => true,
            (Running, Completed | Failed) => true,
            (Queued | Initializing, Cancelled) => true,
            // Startup failures are reported before the job reaches Running.
            (Initializing, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-supplied fields of a new job.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub tenant_id: String,
    pub user_id: String,
    pub model_name: Option<String>,
    pub priority: u8,
    pub package_path: String,
    pub package_hash: String,
}

/// A submitted calculation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    pub user_id: String,
    #[serde(default)]
    pub model_name: Option<String>,
    pub priority: u8,
    pub status: JobStatus,
    pub package_path: String,
    pub package_hash: String,
    pub stream_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

impl Job {
    /// Create a queued job from a submission.
    ///
    /// `stream_base_url` is the public base the client will stream results
    /// from; the job's URL is `{stream_base_url}/jobs/{id}/stream`.
    pub fn from_submission(submission: JobSubmission, stream_base_url: &str) -> Self {
        let id = JobId::new();
        let stream_url = format!(
            "{}/jobs/{}/stream",
            stream_base_url.trim_end_matches('/'),
            id
        );

        Self {
            id,
            tenant_id: submission.tenant_id,
            user_id: submission.user_id,
            model_name: submission.model_name,
            priority: submission.priority,
            status: JobStatus::Queued,
            package_path: submission.package_path,
            package_hash: submission.package_hash,
            stream_url,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            duration_seconds: None,
        }
    }

    /// Dispatch score of this job. Lower scores dequeue first.
    pub fn dispatch_score(&self) -> f64 {
        dispatch_score(self.priority, self.created_at)
    }
}

/// `(10 - priority) * 10^10 + created_at_epoch_seconds`.
///
/// Priority dominates; within a priority, earlier creation wins. The result
/// stays below 2^53 so it is exact as a sorted-set score.
pub fn dispatch_score(priority: u8, created_at: DateTime<Utc>) -> f64 {
    let band = i64::from(MAX_PRIORITY.saturating_sub(priority)) * 10_000_000_000;
    (band + created_at.timestamp()) as f64
}

/// Optional field updates applied alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl JobUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Apply the update to `job`, moving it to `status`.
    pub(crate) fn apply(self, job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        if let Some(result) = self.result {
            job.result = Some(result);
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        if let Some(duration) = self.duration_seconds {
            job.duration_seconds = Some(duration);
        }

        if status.is_terminal() && !job.status.is_terminal() {
            let completed_at = *job.completed_at.get_or_insert(now);
            if job.duration_seconds.is_none() {
                if let Some(started_at) = job.started_at {
                    let elapsed = completed_at - started_at;
                    job.duration_seconds = Some(elapsed.num_milliseconds() as f64 / 1000.0);
                }
            }
        }

        job.status = status;
    }
}
