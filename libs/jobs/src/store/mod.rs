//! Record store abstraction backing the job queue.
//!
//! The queue needs a small subset of a key/value store with sorted-set
//! semantics:
//! - Per-key get/set with TTL
//! - Plain set membership (tenant index)
//! - Sorted sets with atomic pop-minimum (status indexes)
//! - Atomic multi-operation batches, so a record write and its index move
//!   are observed together

mod memory;
mod redis_store;

pub use self::memory::MemoryRecordStore;
pub use self::redis_store::RedisRecordStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Set `key` to `value`, expiring after `ttl`.
    Put {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Add `member` to the set at `key`.
    SetAdd { key: String, member: String },
    /// Remove `member` from the set at `key`.
    SetRemove { key: String, member: String },
    /// Expire the whole set at `key` after `ttl`, replacing any earlier expiry.
    ExpireSet { key: String, ttl: Duration },
    /// Add or rescore `member` in the sorted set at `key`.
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Remove `member` from the sorted set at `key`.
    SortedRemove { key: String, member: String },
}

/// Key/value store with sorted-set semantics.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Apply all operations atomically, in order.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    /// Members of the plain set at `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically remove and return the lowest-scored member of `key`.
    ///
    /// Under concurrent callers each member is returned to at most one.
    async fn pop_min(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;

    /// Number of members in the sorted set at `key`.
    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Members of the sorted set at `key`, lowest score first.
    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}
