//! Shared application state.

use std::sync::Arc;

use calcbridge_jobs::{Job, JobSubmission, PriorityJobQueue, QueueResult};
use tracing::info;

use crate::lifecycle::NamespaceLifecycleManager;

/// Handles to the job queue and the lifecycle manager.
///
/// Built once at startup; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    queue: PriorityJobQueue,
    lifecycle: Arc<NamespaceLifecycleManager>,
    stream_base_url: String,
}

impl AppState {
    pub fn new(
        queue: PriorityJobQueue,
        lifecycle: Arc<NamespaceLifecycleManager>,
        stream_base_url: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                queue,
                lifecycle,
                stream_base_url: stream_base_url.into(),
            }),
        }
    }

    pub fn queue(&self) -> &PriorityJobQueue {
        &self.inner.queue
    }

    pub fn lifecycle(&self) -> &Arc<NamespaceLifecycleManager> {
        &self.inner.lifecycle
    }

    /// Build a job from a submission and queue it.
    pub async fn submit_job(&self, submission: JobSubmission) -> QueueResult<Job> {
        let job = Job::from_submission(submission, &self.inner.stream_base_url);
        self.inner.queue.enqueue(&job).await?;
        info!(job_id = %job.id, stream_url = %job.stream_url, "Accepted job");
        Ok(job)
    }
}
