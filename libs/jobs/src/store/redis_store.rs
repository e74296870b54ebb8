//! Redis-backed record store.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{RecordStore, StoreError, StoreOp};

/// Record store on a multiplexed Redis connection.
///
/// Batches run inside `MULTI`/`EXEC`; pop-minimum is `ZPOPMIN`, which Redis
/// executes atomically so concurrent consumers never receive the same member.
#[derive(Clone)]
pub struct RedisRecordStore {
    conn: MultiplexedConnection,
}

impl RedisRecordStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!("Connecting to record store");
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Record store connection established");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                StoreOp::Put { key, value, ttl } => {
                    // SETEX rejects a zero expiry.
                    let secs = ttl.as_secs().max(1);
                    pipe.set_ex(key, value, secs).ignore();
                }
                StoreOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                StoreOp::SetRemove { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                StoreOp::ExpireSet { key, ttl } => {
                    let secs = ttl.as_secs().max(1) as i64;
                    pipe.expire(key, secs).ignore();
                }
                StoreOp::SortedAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreOp::SortedRemove { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        debug!(ops = ops.len(), "Applied record store batch");
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn pop_min(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(key, 1).await?;
        Ok(popped.into_iter().next())
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(key, 0, -1).await?;
        Ok(members)
    }
}
