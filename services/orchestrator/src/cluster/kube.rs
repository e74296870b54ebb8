//! Kubernetes REST client.
//!
//! Talks to the core/v1 API directly over HTTPS with bearer-token auth.
//! Only the handful of endpoints the orchestrator needs are covered.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::{
    ClusterError, ClusterResult, ControlPlane, Namespace, ObjectList, PersistentVolumeClaim, Pod,
};

/// Connection settings for the Kubernetes API.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server base URL, e.g. `https://kubernetes.default.svc`.
    pub api_url: String,

    /// Bearer token.
    pub token: Option<String>,

    /// PEM bundle used to verify the API server certificate.
    pub ca_pem: Option<Vec<u8>>,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl KubeConfig {
    /// Build a config from service-account style files.
    ///
    /// Missing files are tolerated so the same config works outside a pod.
    pub fn from_files(api_url: String, token_file: &str, ca_file: &str) -> Self {
        let token = match std::fs::read_to_string(token_file) {
            Ok(token) => Some(token.trim().to_string()),
            Err(e) => {
                warn!(path = %token_file, error = %e, "No cluster token file; using anonymous access");
                None
            }
        };
        let ca_pem = std::fs::read(ca_file).ok();

        Self {
            api_url,
            token,
            ca_pem,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Typed<'a, T> {
    api_version: &'static str,
    kind: &'static str,
    #[serde(flatten)]
    object: &'a T,
}

/// [`ControlPlane`] backed by the Kubernetes API.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: &KubeConfig) -> ClusterResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout);
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| ClusterError::Config(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| ClusterError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Map non-success responses onto [`ClusterError`].
    async fn check(response: Response, what: &str) -> ClusterResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(ClusterError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(ClusterError::Conflict(what.to_string())),
            _ => {
                error!(status = %status, body = %body, resource = %what, "Cluster API call failed");
                Err(ClusterError::Api {
                    status: status.as_u16(),
                    message: body,
                })
            }
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        selector: Option<&str>,
    ) -> ClusterResult<Vec<T>> {
        let mut request = self.request(Method::GET, path);
        if let Some(selector) = selector {
            request = request.query(&[("labelSelector", selector)]);
        }
        let response = Self::check(request.send().await?, path).await?;
        let list: ObjectList<T> = serde_json::from_slice(&response.bytes().await?)?;
        Ok(list.items)
    }
}

#[async_trait]
impl ControlPlane for KubeClient {
    async fn get_namespace(&self, name: &str) -> ClusterResult<Option<Namespace>> {
        let path = format!("/api/v1/namespaces/{name}");
        let response = self.request(Method::GET, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, &path).await?;
        Ok(Some(serde_json::from_slice(&response.bytes().await?)?))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<Namespace> {
        let body = Typed {
            api_version: "v1",
            kind: "Namespace",
            object: namespace,
        };
        debug!(namespace = %namespace.metadata.name, "Creating namespace");

        let response = self
            .request(Method::POST, "/api/v1/namespaces")
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response, &namespace.metadata.name).await?;
        Ok(serde_json::from_slice(&response.bytes().await?)?)
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> ClusterResult<()> {
        let path = format!("/api/v1/namespaces/{name}");
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });

        let response = self
            .request(Method::PATCH, &path)
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await?;
        Self::check(response, &path).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClusterResult<()> {
        let path = format!("/api/v1/namespaces/{name}");
        let response = self.request(Method::DELETE, &path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(namespace = %name, "Namespace already deleted");
            return Ok(());
        }
        Self::check(response, &path).await?;
        Ok(())
    }

    async fn list_namespaces(&self, selector: &str) -> ClusterResult<Vec<Namespace>> {
        self.list("/api/v1/namespaces", Some(selector)).await
    }

    async fn list_pods(&self, namespace: &str) -> ClusterResult<Vec<Pod>> {
        self.list(&format!("/api/v1/namespaces/{namespace}/pods"), None)
            .await
    }

    async fn list_claims(&self, namespace: &str) -> ClusterResult<Vec<PersistentVolumeClaim>> {
        self.list(
            &format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims"),
            None,
        )
        .await
    }

    async fn list_claims_all_namespaces(
        &self,
        selector: &str,
    ) -> ClusterResult<Vec<PersistentVolumeClaim>> {
        self.list("/api/v1/persistentvolumeclaims", Some(selector))
            .await
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
    ) -> ClusterResult<String> {
        let path = format!("/api/v1/namespaces/{namespace}/pods/{pod}/log");
        let mut request = self.request(Method::GET, &path);
        if let Some(container) = container {
            request = request.query(&[("container", container)]);
        }
        let response = Self::check(request.send().await?, &path).await?;
        Ok(response.text().await?)
    }
}
