//! In-process record store for development and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use super::{RecordStore, StoreError, StoreOp};

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, HashSet<String>>,
    set_expiry: HashMap<String, Instant>,
    sorted: HashMap<String, HashMap<String, f64>>,
}

/// Record store held in process memory.
///
/// Every operation runs under a single lock, which gives the same atomicity
/// guarantees the queue relies on from Redis.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

/// Lowest score first; ties broken by member, as Redis does.
fn min_member(members: &HashMap<String, f64>) -> Option<(String, f64)> {
    members
        .iter()
        .min_by(|(a_member, a_score), (b_member, b_score)| {
            a_score
                .total_cmp(b_score)
                .then_with(|| a_member.cmp(b_member))
        })
        .map(|(member, score)| (member.clone(), *score))
}

impl Inner {
    /// Drop the set at `key` if its expiry has passed.
    fn expire_set(&mut self, key: &str) {
        let expired = self
            .set_expiry
            .get(key)
            .is_some_and(|expires_at| *expires_at <= Instant::now());
        if expired {
            self.set_expiry.remove(key);
            self.sets.remove(key);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        let expired = match inner.values.get(key) {
            Some((_, expires_at)) => *expires_at <= Instant::now(),
            None => return Ok(None),
        };
        if expired {
            inner.values.remove(key);
            return Ok(None);
        }
        Ok(inner.values.get(key).map(|(value, _)| value.clone()))
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for op in ops {
            match op {
                StoreOp::Put { key, value, ttl } => {
                    inner.values.insert(key, (value, Instant::now() + ttl));
                }
                StoreOp::SetAdd { key, member } => {
                    inner.expire_set(&key);
                    inner.sets.entry(key).or_default().insert(member);
                }
                StoreOp::SetRemove { key, member } => {
                    if let Some(members) = inner.sets.get_mut(&key) {
                        members.remove(&member);
                    }
                }
                StoreOp::ExpireSet { key, ttl } => {
                    if inner.sets.contains_key(&key) {
                        inner.set_expiry.insert(key, Instant::now() + ttl);
                    }
                }
                StoreOp::SortedAdd { key, member, score } => {
                    inner.sorted.entry(key).or_default().insert(member, score);
                }
                StoreOp::SortedRemove { key, member } => {
                    if let Some(members) = inner.sorted.get_mut(&key) {
                        members.remove(&member);
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock()?;
        inner.expire_set(key);
        Ok(inner
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn pop_min(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let mut inner = self.lock()?;
        let Some(members) = inner.sorted.get_mut(key) else {
            return Ok(None);
        };
        let popped = min_member(members);
        if let Some((member, _)) = &popped {
            members.remove(member);
        }
        Ok(popped)
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.lock()?;
        Ok(inner.sorted.get(key).map(HashMap::len).unwrap_or(0))
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let Some(members) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<_> = members.iter().collect();
        ordered.sort_by(|(a_member, a_score), (b_member, b_score)| {
            a_score
                .total_cmp(b_score)
                .then_with(|| a_member.cmp(b_member))
        });
        Ok(ordered.into_iter().map(|(m, _)| m.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_pop_min_breaks_ties_by_member() {
        let store = MemoryRecordStore::new();
        store
            .apply(vec![
                StoreOp::SortedAdd {
                    key: "z".into(),
                    member: "b".into(),
                    score: 1.0,
                },
                StoreOp::SortedAdd {
                    key: "z".into(),
                    member: "a".into(),
                    score: 1.0,
                },
                StoreOp::SortedAdd {
                    key: "z".into(),
                    member: "c".into(),
                    score: 0.5,
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.pop_min("z").await.unwrap(), Some(("c".into(), 0.5)));
        assert_eq!(store.pop_min("z").await.unwrap(), Some(("a".into(), 1.0)));
        assert_eq!(store.pop_min("z").await.unwrap(), Some(("b".into(), 1.0)));
        assert_eq!(store.pop_min("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_values_read_as_absent() {
        let store = MemoryRecordStore::new();
        store
            .apply(vec![StoreOp::Put {
                key: "k".into(),
                value: "v".into(),
                ttl: Duration::ZERO,
            }])
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_expiry_drops_whole_set() {
        let store = MemoryRecordStore::new();
        store
            .apply(vec![
                StoreOp::SetAdd {
                    key: "s".into(),
                    member: "a".into(),
                },
                StoreOp::SetAdd {
                    key: "s".into(),
                    member: "b".into(),
                },
                StoreOp::SetRemove {
                    key: "s".into(),
                    member: "b".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a".to_string()]);

        store
            .apply(vec![StoreOp::ExpireSet {
                key: "s".into(),
                ttl: Duration::ZERO,
            }])
            .await
            .unwrap();
        assert!(store.set_members("s").await.unwrap().is_empty());

        // A fresh add after expiry starts a new set without the old expiry.
        store
            .apply(vec![StoreOp::SetAdd {
                key: "s".into(),
                member: "c".into(),
            }])
            .await
            .unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["c".to_string()]);
    }
}
