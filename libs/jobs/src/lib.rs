//! # calcbridge-jobs
//!
//! Job records and the priority dispatch queue.
//!
//! Jobs are stored as JSON records keyed by ID, indexed per tenant, and
//! placed in one sorted set per status. The queued set is ordered by
//! dispatch score so that higher priority jobs leave first and equal
//! priority jobs leave in creation order.
//!
//! The store is abstracted behind [`RecordStore`]; [`RedisRecordStore`] is
//! the production backend and [`MemoryRecordStore`] serves development and
//! tests.

mod id;
mod job;
mod queue;
pub mod store;

pub use id::{IdError, JobId};
pub use job::{dispatch_score, Job, JobStatus, JobSubmission, JobUpdate, MAX_PRIORITY};
pub use queue::{
    job_key, status_key, tenant_key, PriorityJobQueue, QueueError, QueueResult, RECORD_TTL,
    RECORD_TTL_SECS,
};
pub use store::{MemoryRecordStore, RecordStore, RedisRecordStore, StoreError, StoreOp};
