//! Priority job queue over a [`RecordStore`].
//!
//! Key layout:
//! - `calcbridge:job:{id}`: JSON job record, expiring after [`RECORD_TTL`]
//! - `calcbridge:tenant:{tenant}:jobs`: set of the tenant's job IDs
//! - `calcbridge:status:{status}`: sorted set of IDs by dispatch score
//!
//! Every status change goes through [`PriorityJobQueue::update_status`], which
//! writes the record, adds the ID to the new status set, and removes it from
//! every other status set in one batch. Concurrent transitions of one job
//! therefore leave the ID in exactly one set, the one the last record write
//! names.
//!
//! Indexes are bounded by the same retention window as the records: the
//! tenant set expires [`RECORD_TTL`] after its newest write, and
//! [`PriorityJobQueue::prune_expired`] drops status-set members whose record
//! is gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::id::JobId;
use crate::job::{Job, JobStatus, JobUpdate, MAX_PRIORITY};
use crate::store::{RecordStore, StoreError, StoreOp};

/// Retention window for job records, in seconds.
pub const RECORD_TTL_SECS: u64 = 86_400;

/// Retention window for job records.
pub const RECORD_TTL: Duration = Duration::from_secs(RECORD_TTL_SECS);

const KEY_PREFIX: &str = "calcbridge";

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The record store call failed.
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job does not exist (or its record has expired).
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job's priority is outside `0..=10`.
    #[error("invalid priority {0}; expected 0..=10")]
    InvalidPriority(u8),
}

impl QueueError {
    /// Infrastructure failures are worth retrying; caller errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

pub fn job_key(id: &JobId) -> String {
    format!("{KEY_PREFIX}:job:{id}")
}

pub fn tenant_key(tenant_id: &str) -> String {
    format!("{KEY_PREFIX}:tenant:{tenant_id}:jobs")
}

pub fn status_key(status: JobStatus) -> String {
    format!("{KEY_PREFIX}:status:{}", status.as_str())
}

/// Dispatch queue for calculation jobs.
#[derive(Clone)]
pub struct PriorityJobQueue {
    store: Arc<dyn RecordStore>,
}

impl PriorityJobQueue {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Store a new job and place it in the queued set.
    ///
    /// On error the job must not be considered scheduled.
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id))]
    pub async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        if job.priority > MAX_PRIORITY {
            return Err(QueueError::InvalidPriority(job.priority));
        }

        let id = job.id.to_string();
        let ops = vec![
            StoreOp::Put {
                key: job_key(&job.id),
                value: serde_json::to_string(job)?,
                ttl: RECORD_TTL,
            },
            StoreOp::SetAdd {
                key: tenant_key(&job.tenant_id),
                member: id.clone(),
            },
            StoreOp::ExpireSet {
                key: tenant_key(&job.tenant_id),
                ttl: RECORD_TTL,
            },
            StoreOp::SortedAdd {
                key: status_key(job.status),
                member: id,
                score: job.dispatch_score(),
            },
        ];
        self.store.apply(ops).await?;

        info!(
            priority = job.priority,
            status = %job.status,
            "Enqueued job"
        );
        Ok(())
    }

    /// Pop the lowest-score queued job and move it to `Initializing`.
    ///
    /// Returns `None` when nothing is queued.
    #[instrument(skip(self))]
    pub async fn dequeue_next(&self) -> QueueResult<Option<Job>> {
        let queued = status_key(JobStatus::Queued);

        loop {
            let Some((member, score)) = self.store.pop_min(&queued).await? else {
                return Ok(None);
            };

            let id = match JobId::parse(&member) {
                Ok(id) => id,
                Err(e) => {
                    warn!(member = %member, error = %e, "Dropping malformed queue member");
                    continue;
                }
            };

            let job = match self.get(&id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(job_id = %id, "Skipping queued job with expired record");
                    continue;
                }
                Err(e) => {
                    self.requeue(&member, score).await;
                    return Err(e);
                }
            };

            if job.status != JobStatus::Queued {
                warn!(
                    job_id = %id,
                    status = %job.status,
                    "Queued set held a job in another status; skipping"
                );
                continue;
            }

            return match self
                .update_status(&id, JobStatus::Initializing, JobUpdate::started(Utc::now()))
                .await
            {
                Ok(job) => {
                    info!(job_id = %id, priority = job.priority, "Dequeued job");
                    Ok(Some(job))
                }
                Err(e) => {
                    self.requeue(&member, score).await;
                    Err(e)
                }
            };
        }
    }

    /// Put a popped member back after a failed transition.
    async fn requeue(&self, member: &str, score: f64) {
        let op = StoreOp::SortedAdd {
            key: status_key(JobStatus::Queued),
            member: member.to_string(),
            score,
        };
        if let Err(e) = self.store.apply(vec![op]).await {
            warn!(member = %member, error = %e, "Failed to return job to the queue");
        }
    }

    /// Fetch a job record.
    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let Some(raw) = self.store.get(&job_key(id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Apply `update` and move the job to `status`.
    ///
    /// This is the only path that changes status-set membership. The ID is
    /// removed from every other status set rather than only the one read
    /// here, so a concurrent transition that read the same previous status
    /// cannot leave the ID in two sets.
    #[instrument(skip_all, fields(job_id = %id, status = %status))]
    pub async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        update: JobUpdate,
    ) -> QueueResult<Job> {
        let mut job = self.get(id).await?.ok_or(QueueError::NotFound(*id))?;
        let previous = job.status;

        update.apply(&mut job, status, Utc::now());

        let member = id.to_string();
        let mut ops = vec![
            StoreOp::Put {
                key: job_key(id),
                value: serde_json::to_string(&job)?,
                ttl: RECORD_TTL,
            },
            StoreOp::ExpireSet {
                key: tenant_key(&job.tenant_id),
                ttl: RECORD_TTL,
            },
        ];
        ops.extend(
            JobStatus::ALL
                .into_iter()
                .filter(|other| *other != status)
                .map(|other| StoreOp::SortedRemove {
                    key: status_key(other),
                    member: member.clone(),
                }),
        );
        ops.push(StoreOp::SortedAdd {
            key: status_key(status),
            member,
            score: job.dispatch_score(),
        });
        self.store.apply(ops).await?;

        debug!(from = %previous, to = %status, "Updated job status");
        Ok(job)
    }

    /// List up to `limit` of a tenant's jobs.
    ///
    /// Records that fail to load are skipped. Index members that are
    /// malformed or whose record has expired are removed from the index.
    pub async fn list_for_tenant(&self, tenant_id: &str, limit: usize) -> QueueResult<Vec<Job>> {
        let key = tenant_key(tenant_id);
        let members = self.store.set_members(&key).await?;

        let mut jobs = Vec::with_capacity(limit.min(members.len()));
        let mut dead = Vec::new();
        for member in members {
            if jobs.len() >= limit {
                break;
            }
            let Ok(id) = JobId::parse(&member) else {
                warn!(member = %member, "Dropping malformed tenant index member");
                dead.push(member);
                continue;
            };
            match self.get(&id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => dead.push(member),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Skipping job that failed to load");
                }
            }
        }

        if !dead.is_empty() {
            let removed = dead.len();
            let ops = dead
                .into_iter()
                .map(|member| StoreOp::SetRemove {
                    key: key.clone(),
                    member,
                })
                .collect();
            match self.store.apply(ops).await {
                Ok(()) => debug!(tenant_id = %tenant_id, removed, "Pruned tenant index"),
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "Failed to prune tenant index"),
            }
        }

        Ok(jobs)
    }

    /// Drop status-set members whose record has expired or is unreadable.
    ///
    /// The queued set is skipped; `dequeue_next` already discards dead
    /// members as it pops them. Returns the number of members removed.
    #[instrument(skip(self))]
    pub async fn prune_expired(&self) -> QueueResult<usize> {
        let mut removed = 0;
        for status in JobStatus::ALL {
            if status == JobStatus::Queued {
                continue;
            }
            let key = status_key(status);
            let mut ops = Vec::new();
            for member in self.store.sorted_members(&key).await? {
                let live = match JobId::parse(&member) {
                    Ok(id) => self.store.get(&job_key(&id)).await?.is_some(),
                    Err(_) => false,
                };
                if !live {
                    ops.push(StoreOp::SortedRemove {
                        key: key.clone(),
                        member,
                    });
                }
            }
            if !ops.is_empty() {
                removed += ops.len();
                self.store.apply(ops).await?;
            }
        }

        if removed > 0 {
            info!(removed, "Pruned expired jobs from status sets");
        }
        Ok(removed)
    }

    /// Number of jobs waiting to be dispatched.
    pub async fn queue_depth(&self) -> QueueResult<usize> {
        Ok(self.store.sorted_len(&status_key(JobStatus::Queued)).await?)
    }

    /// IDs currently in the status set for `status`, in dispatch order.
    pub async fn ids_in_status(&self, status: JobStatus) -> QueueResult<Vec<String>> {
        Ok(self.store.sorted_members(&status_key(status)).await?)
    }
}
