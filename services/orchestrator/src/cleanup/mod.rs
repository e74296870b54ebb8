//! Background reaping of finalized and idle bucket namespaces, plus
//! pruning of expired job index entries.

mod index;
mod retry;
mod worker;

pub use index::IndexPruneWorker;
pub use retry::{RetryDecision, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
pub use worker::{CleanupStats, CleanupWorker, CleanupWorkerConfig};
