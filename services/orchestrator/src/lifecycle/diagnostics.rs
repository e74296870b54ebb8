//! Diagnostic extraction ahead of namespace deletion.
//!
//! Archive layout inside the diagnostics container:
//! - `{bucket}/{ts}/logs/{pod}/{container}.log` for each pod container
//! - `{bucket}/{ts}/sentinel_violations.json` when any pod carries
//!   integrity-violation evidence

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::metadata::ANNOTATION_SENTINEL_VIOLATIONS;
use super::{LifecycleResult, NamespaceLifecycleManager};

/// Outcome of one extraction attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticExtractionResult {
    /// At least one log was archived.
    pub logs_archived: bool,

    /// The violation scan completed; true even when nothing was found.
    pub sentinel_violations_indexed: bool,

    /// Every blob path written.
    pub archived_paths: Vec<String>,

    /// Set when extraction could not run at all.
    pub error: Option<String>,
}

impl DiagnosticExtractionResult {
    pub fn is_complete(&self) -> bool {
        self.logs_archived && self.sentinel_violations_indexed && self.error.is_none()
    }
}

/// Keep one blob path segment from splitting into several.
fn path_segment(raw: &str) -> String {
    raw.replace('/', "_")
}

impl NamespaceLifecycleManager {
    /// Archive pod logs and integrity-violation evidence for a namespace.
    ///
    /// Never fails: a total failure is reported through `error` so the
    /// caller can decide whether to delete anyway.
    #[instrument(skip(self))]
    pub async fn extract_diagnostics(
        &self,
        namespace: &str,
        bucket_id: &str,
    ) -> DiagnosticExtractionResult {
        let mut result = DiagnosticExtractionResult::default();

        if let Err(e) = self.archive(namespace, bucket_id, &mut result).await {
            error!(namespace = %namespace, error = %e, "Diagnostic extraction failed");
            result.error = Some(e.to_string());
        }

        info!(
            namespace = %namespace,
            logs_archived = result.logs_archived,
            sentinel_violations_indexed = result.sentinel_violations_indexed,
            archived = result.archived_paths.len(),
            "Diagnostic extraction finished"
        );
        result
    }

    async fn archive(
        &self,
        namespace: &str,
        bucket_id: &str,
        result: &mut DiagnosticExtractionResult,
    ) -> LifecycleResult<()> {
        let container = self.config.diagnostics_container.as_str();
        self.blobs.ensure_container(container).await?;
        let pods = self.cluster.list_pods(namespace).await?;

        let extracted_at = Utc::now();
        let prefix = format!(
            "{}/{}",
            path_segment(bucket_id),
            extracted_at.format("%Y%m%dT%H%M%SZ")
        );

        let mut violations = Vec::new();
        for pod in &pods {
            let pod_name = pod.metadata.name.as_str();
            let containers: Vec<Option<&str>> = match pod.container_names() {
                names if names.is_empty() => vec![None],
                names => names.into_iter().map(Some).collect(),
            };

            for container_name in containers {
                let file = container_name.unwrap_or(pod_name);
                let path = format!(
                    "{prefix}/logs/{}/{}.log",
                    path_segment(pod_name),
                    path_segment(file)
                );

                let logs = match self.cluster.pod_logs(namespace, pod_name, container_name).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(pod = %pod_name, container = ?container_name, error = %e, "Failed to fetch pod logs");
                        continue;
                    }
                };
                match self.blobs.put_blob(container, &path, Bytes::from(logs)).await {
                    Ok(()) => result.archived_paths.push(path),
                    Err(e) => {
                        warn!(pod = %pod_name, path = %path, error = %e, "Failed to archive pod logs");
                    }
                }
            }

            if let Some(raw) = pod.metadata.annotations.get(ANNOTATION_SENTINEL_VIOLATIONS) {
                let evidence = serde_json::from_str::<serde_json::Value>(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
                violations.push(serde_json::json!({ "pod": pod_name, "evidence": evidence }));
            }
        }
        result.logs_archived = !result.archived_paths.is_empty();

        if violations.is_empty() {
            result.sentinel_violations_indexed = true;
            return Ok(());
        }

        let path = format!("{prefix}/sentinel_violations.json");
        let record = serde_json::json!({
            "namespace": namespace,
            "bucket_id": bucket_id,
            "extracted_at": extracted_at.to_rfc3339(),
            "violations": violations,
        });
        match self
            .blobs
            .put_blob(container, &path, Bytes::from(serde_json::to_vec_pretty(&record)?))
            .await
        {
            Ok(()) => {
                warn!(
                    namespace = %namespace,
                    violations = violations.len(),
                    path = %path,
                    "Indexed integrity violations"
                );
                result.archived_paths.push(path);
                result.sentinel_violations_indexed = true;
            }
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to index integrity violations");
            }
        }

        Ok(())
    }
}
