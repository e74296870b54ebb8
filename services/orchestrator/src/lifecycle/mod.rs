//! Namespace lifecycle management.
//!
//! Each tenant bucket gets one isolated namespace:
//!
//! `(absent) → active → finalized → reaping → (absent)`, with `active →
//! reaping` reachable directly once a namespace has been idle past the
//! inactivity threshold.
//!
//! All state lives on the namespace object itself (labels and annotations),
//! never in process memory, so several orchestrators can run at once. Every
//! transition is idempotent or loss-tolerant: creation checks for an
//! existing namespace first, activity refresh is last-write-wins, and
//! deletion treats an absent namespace as done.

mod diagnostics;
mod metadata;
mod reap;

pub use diagnostics::DiagnosticExtractionResult;
pub use metadata::{
    bucket_label_value, management_labels, namespace_name, NamespaceMetadata, NamespaceStatus,
    ANNOTATION_BUCKET_ID, ANNOTATION_CREATED_AT, ANNOTATION_FINALIZED_AT,
    ANNOTATION_LAST_ACTIVITY, ANNOTATION_REAPING_STARTED_AT, ANNOTATION_SENTINEL_VIOLATIONS,
    ANNOTATION_STATUS, LABEL_BUCKET_ID, LABEL_LIFECYCLE, LABEL_MANAGED_BY, LIFECYCLE_TRANSIENT,
};
pub use reap::ReapOutcome;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{label_selector, ClusterError, ControlPlane, Namespace, ObjectMeta};
use crate::storage::{BlobStore, StorageError};

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lifecycle manager settings.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Value of the `managed-by` label.
    pub platform: String,

    /// Idle time after which an active namespace is reaped.
    pub inactivity_threshold: TimeDelta,

    /// Object storage container for diagnostic archives.
    pub diagnostics_container: String,

    /// Number of absence checks after issuing deletion.
    pub deletion_poll_attempts: u32,

    /// Delay between absence checks.
    pub deletion_poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            platform: "calcbridge".to_string(),
            inactivity_threshold: TimeDelta::hours(24),
            diagnostics_container: "diagnostics".to_string(),
            deletion_poll_attempts: 60,
            deletion_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Provisions, tracks, and reaps bucket namespaces.
pub struct NamespaceLifecycleManager {
    cluster: Arc<dyn ControlPlane>,
    blobs: Arc<dyn BlobStore>,
    config: LifecycleConfig,
}

impl NamespaceLifecycleManager {
    pub fn new(
        cluster: Arc<dyn ControlPlane>,
        blobs: Arc<dyn BlobStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            cluster,
            blobs,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn management_selector(&self) -> String {
        let labels = management_labels(&self.config.platform);
        let pairs: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (*k, v.as_str())).collect();
        label_selector(&pairs)
    }

    /// Ensure the bucket's namespace exists and return its name.
    ///
    /// An existing namespace is returned unchanged. A concurrent creator
    /// winning the race is treated the same way.
    #[instrument(skip(self))]
    pub async fn create_namespace_for_bucket(&self, bucket_id: &str) -> LifecycleResult<String> {
        let name = namespace_name(bucket_id);

        if let Some(existing) = self.cluster.get_namespace(&name).await? {
            if existing.is_terminating() {
                warn!(namespace = %name, "Reusing namespace that is still terminating");
            }
            debug!(namespace = %name, "Namespace already exists");
            return Ok(name);
        }

        let now = Utc::now().to_rfc3339();
        let mut labels: BTreeMap<String, String> = management_labels(&self.config.platform)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        labels.insert(LABEL_BUCKET_ID.to_string(), bucket_label_value(bucket_id));

        let annotations = BTreeMap::from([
            (ANNOTATION_BUCKET_ID.to_string(), bucket_id.to_string()),
            (ANNOTATION_CREATED_AT.to_string(), now.clone()),
            (ANNOTATION_LAST_ACTIVITY.to_string(), now),
            (
                ANNOTATION_STATUS.to_string(),
                NamespaceStatus::Active.as_str().to_string(),
            ),
        ]);

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: name.clone(),
                labels,
                annotations,
                ..Default::default()
            },
            status: None,
        };

        match self.cluster.create_namespace(&namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created bucket namespace");
                Ok(name)
            }
            Err(ClusterError::Conflict(_)) => {
                info!(namespace = %name, "Namespace created concurrently; converging");
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a namespace's metadata, or `None` if it does not exist.
    pub async fn get_namespace_metadata(
        &self,
        namespace: &str,
    ) -> LifecycleResult<Option<NamespaceMetadata>> {
        let Some(ns) = self.cluster.get_namespace(namespace).await? else {
            return Ok(None);
        };
        let pods = self.cluster.list_pods(namespace).await?;
        let claims = self.cluster.list_claims(namespace).await?;

        Ok(Some(NamespaceMetadata::from_namespace(
            &ns,
            pods.len(),
            claims.len(),
            Utc::now(),
        )))
    }

    /// Refresh the namespace's last-activity timestamp.
    ///
    /// Best effort: failures are logged and never reach the caller.
    pub async fn update_namespace_activity(&self, namespace: &str) {
        let annotations = BTreeMap::from([(
            ANNOTATION_LAST_ACTIVITY.to_string(),
            Utc::now().to_rfc3339(),
        )]);

        match self
            .cluster
            .patch_namespace_annotations(namespace, &annotations)
            .await
        {
            Ok(()) => debug!(namespace = %namespace, "Refreshed namespace activity"),
            Err(e) => warn!(namespace = %namespace, error = %e, "Failed to refresh namespace activity"),
        }
    }

    /// Mark the namespace finalized, making it eligible for reaping now.
    #[instrument(skip(self))]
    pub async fn mark_namespace_finalized(&self, namespace: &str) -> LifecycleResult<()> {
        let annotations = BTreeMap::from([
            (
                ANNOTATION_STATUS.to_string(),
                NamespaceStatus::Finalized.as_str().to_string(),
            ),
            (ANNOTATION_FINALIZED_AT.to_string(), Utc::now().to_rfc3339()),
        ]);
        self.cluster
            .patch_namespace_annotations(namespace, &annotations)
            .await?;

        info!(namespace = %namespace, "Marked namespace finalized");
        Ok(())
    }

    /// Managed namespaces that are finalized or idle past the threshold.
    #[instrument(skip(self))]
    pub async fn find_namespaces_for_cleanup(&self) -> LifecycleResult<Vec<NamespaceMetadata>> {
        let namespaces = self
            .cluster
            .list_namespaces(&self.management_selector())
            .await?;
        let now = Utc::now();

        let mut eligible = Vec::new();
        for ns in namespaces {
            let name = &ns.metadata.name;
            match self.get_namespace_metadata(name).await {
                Ok(Some(meta)) => {
                    if meta.is_cleanup_eligible(now, self.config.inactivity_threshold) {
                        debug!(
                            namespace = %name,
                            status = %meta.status,
                            idle_secs = meta.idle_for(now).num_seconds(),
                            "Namespace eligible for cleanup"
                        );
                        eligible.push(meta);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(namespace = %name, error = %e, "Skipping namespace with unreadable metadata");
                }
            }
        }

        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockControlPlane;
    use crate::storage::ObjectStoreBlobs;

    fn manager(cluster: Arc<MockControlPlane>) -> NamespaceLifecycleManager {
        NamespaceLifecycleManager::new(
            cluster,
            Arc::new(ObjectStoreBlobs::in_memory()),
            LifecycleConfig::default(),
        )
    }

    fn managed_namespace(
        bucket_id: &str,
        status: NamespaceStatus,
        idle: TimeDelta,
    ) -> Namespace {
        let now = Utc::now();
        Namespace {
            metadata: ObjectMeta {
                name: namespace_name(bucket_id),
                labels: BTreeMap::from([
                    (LABEL_LIFECYCLE.to_string(), LIFECYCLE_TRANSIENT.to_string()),
                    (LABEL_MANAGED_BY.to_string(), "calcbridge".to_string()),
                    (LABEL_BUCKET_ID.to_string(), bucket_id.to_string()),
                ]),
                annotations: BTreeMap::from([
                    (ANNOTATION_BUCKET_ID.to_string(), bucket_id.to_string()),
                    (ANNOTATION_STATUS.to_string(), status.as_str().to_string()),
                    (
                        ANNOTATION_LAST_ACTIVITY.to_string(),
                        (now - idle).to_rfc3339(),
                    ),
                ]),
                ..Default::default()
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let cluster = Arc::new(MockControlPlane::new());
        let manager = manager(cluster.clone());

        let first = manager.create_namespace_for_bucket("b1").await.unwrap();
        let second = manager.create_namespace_for_bucket("b1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cluster.create_calls(), 1);

        let ns = cluster.namespace(&first).unwrap();
        assert_eq!(ns.metadata.labels[LABEL_LIFECYCLE], LIFECYCLE_TRANSIENT);
        assert_eq!(ns.metadata.labels[LABEL_MANAGED_BY], "calcbridge");
        assert_eq!(ns.metadata.labels[LABEL_BUCKET_ID], "b1");
        assert_eq!(ns.metadata.annotations[ANNOTATION_STATUS], "active");
    }

    #[tokio::test]
    async fn test_create_converges_after_losing_race() {
        let cluster = Arc::new(MockControlPlane::new());
        cluster.lose_next_create_race();
        let manager = manager(cluster.clone());

        let name = manager.create_namespace_for_bucket("b2").await.unwrap();

        assert_eq!(name, namespace_name("b2"));
        assert!(cluster.namespace(&name).is_some());
    }

    #[tokio::test]
    async fn test_metadata_of_absent_namespace_is_none() {
        let manager = manager(Arc::new(MockControlPlane::new()));
        assert!(manager
            .get_namespace_metadata("calc-bucket-none")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_activity_refresh_swallows_failures() {
        let cluster = Arc::new(MockControlPlane::new());
        let manager = manager(cluster.clone());
        let name = manager.create_namespace_for_bucket("b1").await.unwrap();

        cluster.fail_patches(true);
        manager.update_namespace_activity(&name).await;
        manager.update_namespace_activity("calc-bucket-missing").await;
    }

    #[tokio::test]
    async fn test_activity_refresh_moves_last_activity_forward() {
        let cluster = Arc::new(MockControlPlane::new());
        cluster.insert_namespace(managed_namespace(
            "b1",
            NamespaceStatus::Active,
            TimeDelta::hours(30),
        ));
        let manager = manager(cluster.clone());
        let name = namespace_name("b1");

        manager.update_namespace_activity(&name).await;

        let meta = manager.get_namespace_metadata(&name).await.unwrap().unwrap();
        assert!(meta.idle_for(Utc::now()) < TimeDelta::minutes(1));
        assert!(manager.find_namespaces_for_cleanup().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalized_namespace_is_eligible_regardless_of_activity() {
        let cluster = Arc::new(MockControlPlane::new());
        let manager = manager(cluster.clone());
        let name = manager.create_namespace_for_bucket("b1").await.unwrap();

        manager.mark_namespace_finalized(&name).await.unwrap();

        let eligible = manager.find_namespaces_for_cleanup().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].namespace, name);
        assert_eq!(eligible[0].status, NamespaceStatus::Finalized);
        assert_eq!(eligible[0].bucket_id, "b1");
    }

    #[tokio::test]
    async fn test_inactivity_threshold_selects_idle_namespaces() {
        let cluster = Arc::new(MockControlPlane::new());
        cluster.insert_namespace(managed_namespace(
            "idle",
            NamespaceStatus::Active,
            TimeDelta::hours(25),
        ));
        cluster.insert_namespace(managed_namespace(
            "recent",
            NamespaceStatus::Active,
            TimeDelta::hours(23),
        ));
        let manager = manager(cluster);

        let eligible = manager.find_namespaces_for_cleanup().await.unwrap();

        let names: Vec<_> = eligible.iter().map(|m| m.namespace.as_str()).collect();
        assert_eq!(names, vec![namespace_name("idle").as_str()]);
    }

    #[tokio::test]
    async fn test_unmanaged_namespaces_are_ignored() {
        let cluster = Arc::new(MockControlPlane::new());
        let mut foreign = managed_namespace("other", NamespaceStatus::Finalized, TimeDelta::zero());
        foreign
            .metadata
            .labels
            .insert(LABEL_MANAGED_BY.to_string(), "someone-else".to_string());
        cluster.insert_namespace(foreign);

        let manager = manager(cluster);
        assert!(manager.find_namespaces_for_cleanup().await.unwrap().is_empty());
    }
}
