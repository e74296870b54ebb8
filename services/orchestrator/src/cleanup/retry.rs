//! Retry bookkeeping for namespaces whose reap did not finish.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default retry limit per namespace.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct RetryEntry {
    bucket_id: String,
    failures: u32,
    first_failure: Instant,
}

/// What to do after a failed reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again on a later cycle. `retry` counts from 1.
    Retry { retry: u32 },

    /// Retries used up within the window.
    Exhausted { failures: u32 },
}

/// Tracks failed reaps per namespace within a sliding window.
///
/// Failures older than the window are forgotten, so a namespace that was
/// given up on becomes retryable again once its window has passed.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    entries: BTreeMap<String, RetryEntry>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            entries: BTreeMap::new(),
        }
    }

    fn expired(&self, entry: &RetryEntry, now: Instant) -> bool {
        now.duration_since(entry.first_failure) > self.window
    }

    /// Record a failed reap of `namespace`.
    pub fn record_failure(&mut self, namespace: &str, bucket_id: &str) -> RetryDecision {
        let now = Instant::now();
        let window = self.window;

        let entry = self
            .entries
            .entry(namespace.to_string())
            .or_insert_with(|| RetryEntry {
                bucket_id: bucket_id.to_string(),
                failures: 0,
                first_failure: now,
            });

        if now.duration_since(entry.first_failure) > window {
            entry.failures = 0;
            entry.first_failure = now;
        }
        entry.failures += 1;

        if entry.failures > self.max_retries {
            RetryDecision::Exhausted {
                failures: entry.failures,
            }
        } else {
            RetryDecision::Retry {
                retry: entry.failures,
            }
        }
    }

    /// Whether `namespace` has used up its retries in the current window.
    pub fn is_exhausted(&self, namespace: &str) -> bool {
        self.entries
            .get(namespace)
            .is_some_and(|entry| {
                !self.expired(entry, Instant::now()) && entry.failures > self.max_retries
            })
    }

    /// Forget `namespace` after a reap that needs no retry.
    pub fn clear(&mut self, namespace: &str) {
        self.entries.remove(namespace);
    }

    /// Namespaces awaiting another attempt, with their bucket IDs.
    pub fn pending(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.failures <= self.max_retries)
            .map(|(ns, entry)| (ns.clone(), entry.bucket_id.clone()))
            .collect()
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries
            .retain(|_, entry| now.duration_since(entry.first_failure) <= window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
