use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::retry::{RetryDecision, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use crate::lifecycle::{LifecycleResult, NamespaceLifecycleManager, ReapOutcome};

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Delay between successful cycles.
    pub check_interval: Duration,

    /// Delay after a cycle that failed outright.
    pub error_backoff: Duration,

    /// Retries per namespace within `retry_window`.
    pub max_retries: u32,

    pub retry_window: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_window: DEFAULT_RETRY_WINDOW,
        }
    }
}

/// Per-cycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub reaped: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub timed_out: usize,
    /// Namespaces whose retries ran out this cycle.
    pub given_up: usize,
}

impl CleanupStats {
    pub fn attempted(&self) -> usize {
        self.reaped + self.failed + self.orphaned + self.timed_out
    }
}

pub struct CleanupWorker {
    lifecycle: Arc<NamespaceLifecycleManager>,
    config: CleanupWorkerConfig,
    retries: Mutex<RetryTracker>,
}

impl CleanupWorker {
    pub fn new(lifecycle: Arc<NamespaceLifecycleManager>, config: CleanupWorkerConfig) -> Self {
        let retries = RetryTracker::new(config.max_retries, config.retry_window);
        Self {
            lifecycle,
            config,
            retries: Mutex::new(retries),
        }
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            inactivity_threshold_hours = self.lifecycle.config().inactivity_threshold.num_hours(),
            "Starting cleanup worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(_) => self.config.check_interval,
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = self.config.error_backoff.as_secs(),
                        "Cleanup cycle failed"
                    );
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Cleanup worker shutting down");
    }

    /// Reap every eligible namespace plus those awaiting a retry.
    ///
    /// Only a failure to list candidates fails the cycle; per-namespace
    /// failures are counted and scheduled for retry.
    pub async fn run_cycle(&self) -> LifecycleResult<CleanupStats> {
        let candidates = self.lifecycle.find_namespaces_for_cleanup().await?;

        let mut targets: BTreeMap<String, String> = BTreeMap::new();
        {
            let mut retries = self.retries();
            retries.prune();
            for meta in candidates {
                if retries.is_exhausted(&meta.namespace) {
                    debug!(namespace = %meta.namespace, "Skipping namespace with exhausted retries");
                    continue;
                }
                targets.insert(meta.namespace, meta.bucket_id);
            }
            for (namespace, bucket_id) in retries.pending() {
                targets.entry(namespace).or_insert(bucket_id);
            }
        }

        let mut stats = CleanupStats::default();
        for (namespace, bucket_id) in &targets {
            match self.lifecycle.reap_namespace(namespace, bucket_id).await {
                Ok(ReapOutcome::Reaped) => {
                    stats.reaped += 1;
                    self.retries().clear(namespace);
                }
                Ok(ReapOutcome::OrphanedClaims { claims }) => {
                    stats.orphaned += 1;
                    self.retries().clear(namespace);
                    error!(
                        namespace = %namespace,
                        bucket_id = %bucket_id,
                        claims = ?claims,
                        "Namespace deleted with orphaned claims; manual remediation required"
                    );
                }
                Ok(ReapOutcome::DeletionTimedOut { attempts }) => {
                    stats.timed_out += 1;
                    warn!(namespace = %namespace, attempts, "Namespace deletion not confirmed");
                    self.schedule_retry(namespace, bucket_id, &mut stats);
                }
                Err(e) => {
                    stats.failed += 1;
                    error!(namespace = %namespace, error = %e, "Failed to reap namespace");
                    self.schedule_retry(namespace, bucket_id, &mut stats);
                }
            }
        }

        if stats.attempted() > 0 {
            info!(
                reaped = stats.reaped,
                failed = stats.failed,
                orphaned = stats.orphaned,
                timed_out = stats.timed_out,
                given_up = stats.given_up,
                "Cleanup cycle complete"
            );
        } else {
            debug!("Cleanup cycle found nothing to reap");
        }

        Ok(stats)
    }

    fn schedule_retry(&self, namespace: &str, bucket_id: &str, stats: &mut CleanupStats) {
        match self.retries().record_failure(namespace, bucket_id) {
            RetryDecision::Retry { retry } => {
                info!(namespace = %namespace, retry, "Scheduled namespace for another reap");
            }
            RetryDecision::Exhausted { failures } => {
                stats.given_up += 1;
                error!(
                    namespace = %namespace,
                    bucket_id = %bucket_id,
                    failures,
                    escalation = true,
                    "Giving up on namespace after repeated reap failures"
                );
            }
        }
    }

    /// Namespaces waiting for another attempt.
    pub fn pending_retries(&self) -> Vec<String> {
        self.retries()
            .pending()
            .into_iter()
            .map(|(namespace, _)| namespace)
            .collect()
    }
}
