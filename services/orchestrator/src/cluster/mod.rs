//! Cluster control-plane interface.
//!
//! The orchestrator only touches namespaces, pods, and persistent volume
//! claims, filtered by labels and carrying state in annotations. This module
//! defines the minimal object shapes for those resources and the
//! [`ControlPlane`] trait implemented by:
//! - [`KubeClient`]: the Kubernetes core/v1 REST API
//! - [`MockControlPlane`]: an in-process cluster for development and tests

mod kube;
mod mock;

pub use kube::{KubeClient, KubeConfig};
pub use mock::MockControlPlane;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for control-plane calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from control-plane calls.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The client could not be configured.
    #[error("client configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Object metadata common to all resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Observed phase of a namespace or pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ObjectStatus>,
}

impl Namespace {
    /// True once deletion has been requested and the namespace is draining.
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
            || self
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Terminating")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PodSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ObjectStatus>,
}

impl Pod {
    pub fn container_names(&self) -> Vec<&str> {
        self.spec
            .as_ref()
            .map(|spec| spec.containers.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
}

/// A list response from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Render `key=value` pairs as a label selector.
pub fn label_selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` satisfy an equality-based selector string.
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
            None => labels.contains_key(term),
        })
}

/// Cluster control-plane operations used by the orchestrator.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch a namespace, or `None` if absent.
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>>;

    /// Create a namespace. Fails with [`ClusterError::Conflict`] if it exists.
    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<Namespace>;

    /// Merge `annotations` into the namespace's annotations.
    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> ClusterResult<()>;

    /// Request namespace deletion. An absent namespace is not an error.
    async fn delete_namespace(&self, name: &str) -> ClusterResult<()>;

    /// List namespaces matching a label selector.
    async fn list_namespaces(&self, selector: &str) -> ClusterResult<Vec<Namespace>>;

    /// List pods in a namespace.
    async fn list_pods(&self, namespace: &str) -> ClusterResult<Vec<Pod>>;

    /// List persistent volume claims in a namespace.
    async fn list_claims(&self, namespace: &str) -> ClusterResult<Vec<PersistentVolumeClaim>>;

    /// List persistent volume claims in all namespaces matching a label selector.
    async fn list_claims_all_namespaces(
        &self,
        selector: &str,
    ) -> ClusterResult<Vec<PersistentVolumeClaim>>;

    /// Read a pod's log. `container` selects one container of a multi-container pod.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> ClusterResult<String>;
}
