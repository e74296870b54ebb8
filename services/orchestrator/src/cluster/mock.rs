//! In-process control plane for development and tests.
//!
//! Holds namespaces, pods, and claims in memory and mimics the API
//! semantics the orchestrator relies on: conflict on duplicate create,
//! not-found on patching an absent namespace, label-selector filtering, and
//! namespace deletion cascading to the namespace's pods and claims.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{
    selector_matches, ClusterError, ClusterResult, ControlPlane, Namespace, ObjectStatus,
    PersistentVolumeClaim, Pod,
};

#[derive(Default)]
struct MockState {
    namespaces: BTreeMap<String, Namespace>,
    pods: BTreeMap<String, Vec<Pod>>,
    claims: Vec<PersistentVolumeClaim>,
    logs: BTreeMap<(String, String), String>,
    failing_logs: HashSet<(String, String)>,
    retain_claims_on_delete: bool,
    stuck_deletions: bool,
    fail_patches: bool,
    fail_lists: bool,
    lose_create_race: bool,
    create_calls: usize,
    delete_calls: usize,
}

/// Mock control plane.
#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a namespace object.
    pub fn insert_namespace(&self, namespace: Namespace) {
        let name = namespace.metadata.name.clone();
        self.state().namespaces.insert(name, namespace);
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state().namespaces.get(name).cloned()
    }

    /// Add a pod with the given log output.
    pub fn add_pod(&self, namespace: &str, mut pod: Pod, logs: &str) {
        pod.metadata.namespace = Some(namespace.to_string());
        let mut state = self.state();
        state.logs.insert(
            (namespace.to_string(), pod.metadata.name.clone()),
            logs.to_string(),
        );
        state.pods.entry(namespace.to_string()).or_default().push(pod);
    }

    /// Make log retrieval fail for one pod.
    pub fn fail_logs_for(&self, namespace: &str, pod: &str) {
        self.state()
            .failing_logs
            .insert((namespace.to_string(), pod.to_string()));
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        self.state().claims.push(claim);
    }

    /// Keep claims around after their namespace is deleted.
    pub fn retain_claims_on_delete(&self, retain: bool) {
        self.state().retain_claims_on_delete = retain;
    }

    /// Leave deleted namespaces in `Terminating` forever.
    pub fn stick_deletions(&self, stuck: bool) {
        self.state().stuck_deletions = stuck;
    }

    /// Fail every annotation patch with a server error.
    pub fn fail_patches(&self, fail: bool) {
        self.state().fail_patches = fail;
    }

    /// Fail every namespace listing with a server error.
    pub fn fail_lists(&self, fail: bool) {
        self.state().fail_lists = fail;
    }

    /// On the next create, behave as if another caller created it first.
    pub fn lose_next_create_race(&self) {
        self.state().lose_create_race = true;
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state().delete_calls
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        Ok(self.state().namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<Namespace> {
        let mut state = self.state();
        state.create_calls += 1;

        let name = namespace.metadata.name.clone();
        let mut created = namespace.clone();
        created.metadata.creation_timestamp = Some(Utc::now());
        created.status = Some(ObjectStatus {
            phase: Some("Active".to_string()),
        });

        if state.lose_create_race {
            state.lose_create_race = false;
            state.namespaces.insert(name.clone(), created);
            return Err(ClusterError::Conflict(name));
        }
        if state.namespaces.contains_key(&name) {
            return Err(ClusterError::Conflict(name));
        }

        info!(namespace = %name, "[MOCK] Created namespace");
        state.namespaces.insert(name, created.clone());
        Ok(created)
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let mut state = self.state();
        if state.fail_patches {
            return Err(ClusterError::Api {
                status: 500,
                message: "patch rejected".to_string(),
            });
        }
        let namespace = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))?;
        namespace
            .metadata
            .annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let mut state = self.state();
        state.delete_calls += 1;

        if state.stuck_deletions {
            if let Some(namespace) = state.namespaces.get_mut(name) {
                namespace.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
                namespace.status = Some(ObjectStatus {
                    phase: Some("Terminating".to_string()),
                });
            }
            return Ok(());
        }

        if state.namespaces.remove(name).is_some() {
            info!(namespace = %name, "[MOCK] Deleted namespace");
        }
        state.pods.remove(name);
        if !state.retain_claims_on_delete {
            state
                .claims
                .retain(|claim| claim.metadata.namespace.as_deref() != Some(name));
        }
        Ok(())
    }

    async fn list_namespaces(&self, selector: &str) -> ClusterResult<Vec<Namespace>> {
        let state = self.state();
        if state.fail_lists {
            return Err(ClusterError::Api {
                status: 503,
                message: "namespace listing unavailable".to_string(),
            });
        }
        Ok(state
            .namespaces
            .values()
            .filter(|ns| selector_matches(selector, &ns.metadata.labels))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: &str) -> ClusterResult<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_claims(&self, namespace: &str) -> ClusterResult<Vec<PersistentVolumeClaim>> {
        Ok(self
            .state()
            .claims
            .iter()
            .filter(|claim| claim.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn list_claims_all_namespaces(
        &self,
        selector: &str,
    ) -> ClusterResult<Vec<PersistentVolumeClaim>> {
        Ok(self
            .state()
            .claims
            .iter()
            .filter(|claim| selector_matches(selector, &claim.metadata.labels))
            .cloned()
            .collect())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        _container: Option<&str>,
    ) -> ClusterResult<String> {
        let state = self.state();
        let key = (namespace.to_string(), pod.to_string());
        if state.failing_logs.contains(&key) {
            return Err(ClusterError::Api {
                status: 500,
                message: format!("log stream for {pod} unavailable"),
            });
        }
        state
            .logs
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{namespace}/{pod}")))
    }
}
