//! The destructive teardown path.
//!
//! Steps run in a fixed order:
//! 1. mark `status=reaping`
//! 2. extract diagnostics (best effort), then mark `status=reaped`
//! 3. request deletion
//! 4. poll until the namespace is gone
//! 5. verify no claim carrying the bucket label is left in the namespace
//!
//! Every step is safe to repeat, and a namespace that is already gone
//! skips straight to verification, so concurrent or repeated reaps of the
//! same namespace only cost redundant work.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use super::metadata::{
    bucket_label_value, NamespaceStatus, ANNOTATION_REAPING_STARTED_AT, ANNOTATION_STATUS,
    LABEL_BUCKET_ID,
};
use super::{LifecycleResult, NamespaceLifecycleManager};
use crate::cluster::label_selector;

/// How a reap attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Deletion confirmed and no orphaned claim found.
    Reaped,

    /// The namespace was still present after every confirmation check.
    DeletionTimedOut { attempts: u32 },

    /// The namespace is gone but claims scoped to it remain.
    ///
    /// Deletion cannot be rolled back; this needs manual remediation.
    OrphanedClaims { claims: Vec<String> },
}

impl ReapOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Reaped)
    }
}

impl NamespaceLifecycleManager {
    /// Tear down a bucket namespace.
    #[instrument(skip(self))]
    pub async fn reap_namespace(
        &self,
        namespace: &str,
        bucket_id: &str,
    ) -> LifecycleResult<ReapOutcome> {
        let marker = BTreeMap::from([
            (
                ANNOTATION_STATUS.to_string(),
                NamespaceStatus::Reaping.as_str().to_string(),
            ),
            (ANNOTATION_REAPING_STARTED_AT.to_string(), Utc::now().to_rfc3339()),
        ]);

        let already_gone = match self
            .cluster
            .patch_namespace_annotations(namespace, &marker)
            .await
        {
            Ok(()) => false,
            Err(e) if e.is_not_found() => {
                info!(namespace = %namespace, "Namespace already deleted; verifying claims only");
                true
            }
            Err(e) => return Err(e.into()),
        };

        if !already_gone {
            info!(namespace = %namespace, "Reaping namespace");

            let extraction = self.extract_diagnostics(namespace, bucket_id).await;
            if !extraction.logs_archived || !extraction.sentinel_violations_indexed {
                warn!(
                    namespace = %namespace,
                    logs_archived = extraction.logs_archived,
                    sentinel_violations_indexed = extraction.sentinel_violations_indexed,
                    error = extraction.error.as_deref().unwrap_or(""),
                    "Diagnostic evidence incomplete; deleting anyway"
                );
            }

            let reaped = BTreeMap::from([(
                ANNOTATION_STATUS.to_string(),
                NamespaceStatus::Reaped.as_str().to_string(),
            )]);
            if let Err(e) = self
                .cluster
                .patch_namespace_annotations(namespace, &reaped)
                .await
            {
                warn!(namespace = %namespace, error = %e, "Failed to mark namespace reaped");
            }

            self.cluster.delete_namespace(namespace).await?;

            if !self.wait_for_deletion(namespace).await {
                let attempts = self.config.deletion_poll_attempts;
                warn!(
                    namespace = %namespace,
                    attempts,
                    "Namespace still present after deletion checks"
                );
                return Ok(ReapOutcome::DeletionTimedOut { attempts });
            }
        }

        let orphans = self.orphaned_claims(namespace, bucket_id).await?;
        if !orphans.is_empty() {
            error!(
                namespace = %namespace,
                bucket_id = %bucket_id,
                claims = ?orphans,
                safety_violation = true,
                "Orphaned volume claims remain after namespace deletion"
            );
            return Ok(ReapOutcome::OrphanedClaims { claims: orphans });
        }

        info!(namespace = %namespace, "Namespace reaped");
        Ok(ReapOutcome::Reaped)
    }

    /// Poll for the namespace to disappear. Returns false on timeout.
    async fn wait_for_deletion(&self, namespace: &str) -> bool {
        for attempt in 1..=self.config.deletion_poll_attempts {
            match self.cluster.get_namespace(namespace).await {
                Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(namespace = %namespace, attempt, error = %e, "Deletion check failed");
                }
            }
            if attempt < self.config.deletion_poll_attempts {
                tokio::time::sleep(self.config.deletion_poll_interval).await;
            }
        }
        false
    }

    /// Names of bucket-labelled claims still scoped to `namespace`.
    async fn orphaned_claims(&self, namespace: &str, bucket_id: &str) -> LifecycleResult<Vec<String>> {
        let label = bucket_label_value(bucket_id);
        let selector = label_selector(&[(LABEL_BUCKET_ID, label.as_str())]);

        let claims = self
            .cluster
            .list_claims_all_namespaces(&selector)
            .await?;
        Ok(claims
            .into_iter()
            .filter(|claim| claim.metadata.namespace.as_deref() == Some(namespace))
            .map(|claim| claim.metadata.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cluster::{
        ClusterError, ControlPlane, MockControlPlane, ObjectMeta, PersistentVolumeClaim, Pod,
    };
    use crate::lifecycle::{namespace_name, LifecycleConfig};
    use crate::storage::ObjectStoreBlobs;

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            deletion_poll_attempts: 3,
            deletion_poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn claim(name: &str, namespace: &str, bucket_id: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                labels: BTreeMap::from([(LABEL_BUCKET_ID.to_string(), bucket_id.to_string())]),
                ..Default::default()
            },
        }
    }

    async fn setup() -> (Arc<MockControlPlane>, Arc<ObjectStoreBlobs>, NamespaceLifecycleManager, String) {
        let cluster = Arc::new(MockControlPlane::new());
        let blobs = Arc::new(ObjectStoreBlobs::in_memory());
        let manager = NamespaceLifecycleManager::new(cluster.clone(), blobs.clone(), fast_config());
        let name = manager.create_namespace_for_bucket("b1").await.unwrap();
        (cluster, blobs, manager, name)
    }

    #[tokio::test]
    async fn test_reap_extracts_then_deletes() {
        let (cluster, _blobs, manager, name) = setup().await;
        let pod = Pod {
            metadata: ObjectMeta {
                name: "solver-0".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        cluster.add_pod(&name, pod, "converged\n");
        cluster.add_claim(claim("scratch", &name, "b1"));

        let outcome = manager.reap_namespace(&name, "b1").await.unwrap();

        assert_eq!(outcome, ReapOutcome::Reaped);
        assert!(outcome.is_success());
        assert!(cluster.namespace(&name).is_none());
        assert!(cluster.list_claims(&name).await.unwrap().is_empty());
        assert_eq!(cluster.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_claim_fails_reap_after_deletion() {
        let (cluster, _blobs, manager, name) = setup().await;
        cluster.add_claim(claim("results-pvc", &name, "b1"));
        cluster.add_claim(claim("other-bucket", "calc-bucket-b9", "b1"));
        cluster.retain_claims_on_delete(true);

        let outcome = manager.reap_namespace(&name, "b1").await.unwrap();

        assert!(cluster.namespace(&name).is_none());
        assert_eq!(
            outcome,
            ReapOutcome::OrphanedClaims {
                claims: vec!["results-pvc".to_string()]
            }
        );
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_stuck_deletion_times_out() {
        let (cluster, _blobs, manager, name) = setup().await;
        cluster.stick_deletions(true);

        let outcome = manager.reap_namespace(&name, "b1").await.unwrap();

        assert_eq!(outcome, ReapOutcome::DeletionTimedOut { attempts: 3 });
        let ns = cluster.namespace(&name).unwrap();
        assert!(ns.is_terminating());
        assert_eq!(ns.metadata.annotations[ANNOTATION_STATUS], "reaped");
        assert!(ns.metadata.annotations.contains_key(ANNOTATION_REAPING_STARTED_AT));
    }

    #[tokio::test]
    async fn test_reaping_an_absent_namespace_only_verifies() {
        let cluster = Arc::new(MockControlPlane::new());
        let manager = NamespaceLifecycleManager::new(
            cluster.clone(),
            Arc::new(ObjectStoreBlobs::in_memory()),
            fast_config(),
        );

        let outcome = manager
            .reap_namespace(&namespace_name("gone"), "gone")
            .await
            .unwrap();

        assert_eq!(outcome, ReapOutcome::Reaped);
        assert_eq!(cluster.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_repeat_reap_is_safe() {
        let (cluster, _blobs, manager, name) = setup().await;

        assert!(manager.reap_namespace(&name, "b1").await.unwrap().is_success());
        assert!(manager.reap_namespace(&name, "b1").await.unwrap().is_success());
        assert_eq!(cluster.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_marker_patch_failure_aborts_before_deletion() {
        let (cluster, _blobs, manager, name) = setup().await;
        cluster.fail_patches(true);

        let err = manager.reap_namespace(&name, "b1").await.unwrap_err();

        assert!(matches!(
            err,
            crate::lifecycle::LifecycleError::Cluster(ClusterError::Api { status: 500, .. })
        ));
        assert!(cluster.namespace(&name).is_some());
        assert_eq!(cluster.delete_calls(), 0);
    }
}
