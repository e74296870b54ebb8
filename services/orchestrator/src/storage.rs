//! Durable blob storage for diagnostic archives.
//!
//! Blobs live in named containers and are addressed by a `/`-separated path.
//! [`ObjectStoreBlobs`] maps containers onto `object_store` backends:
//! - `local`: one directory per container under a root
//! - `azure`: one Azure Blob container per container name; the container
//!   must already exist, and `ensure_container` fails if it does not
//! - `memory`: an in-memory store per container

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from blob storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob path '{path}': {message}")]
    InvalidPath { path: String, message: String },

    /// A remote container is missing or cannot be reached.
    #[error("blob container '{container}' is missing or unreachable: {message}")]
    ContainerUnavailable { container: String, message: String },
}

/// Container-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the container if it does not exist yet.
    async fn ensure_container(&self, container: &str) -> Result<(), StorageError>;

    /// Write `data` at `path`, replacing any existing blob.
    async fn put_blob(&self, container: &str, path: &str, data: Bytes) -> Result<(), StorageError>;
}

/// Which object store backs each container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local { root: PathBuf },
    /// Credentials and account come from the `AZURE_*` environment.
    Azure,
    Memory,
}

/// [`BlobStore`] on top of `object_store`.
pub struct ObjectStoreBlobs {
    backend: StorageBackend,
    containers: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreBlobs {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            backend,
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    fn cached(&self, container: &str) -> Option<Arc<dyn ObjectStore>> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(container)
            .cloned()
    }

    async fn open(&self, container: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        if let Some(store) = self.cached(container) {
            return Ok(store);
        }

        let store: Arc<dyn ObjectStore> = match &self.backend {
            StorageBackend::Local { root } => {
                let dir = root.join(container);
                tokio::fs::create_dir_all(&dir).await?;
                Arc::new(LocalFileSystem::new_with_prefix(&dir)?)
            }
            StorageBackend::Azure => {
                let store = MicrosoftAzureBuilder::from_env()
                    .with_container_name(container)
                    .build()?;
                Arc::new(check_container(store, container).await?)
            }
            StorageBackend::Memory => Arc::new(InMemory::new()),
        };

        info!(container = %container, backend = ?self.backend, "Opened blob container");
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(containers
            .entry(container.to_string())
            .or_insert(store)
            .clone())
    }

    /// Read a blob back. Used by tooling and tests.
    pub async fn read_blob(&self, container: &str, path: &str) -> Result<Bytes, StorageError> {
        let store = self.open(container).await?;
        let location = parse_path(path)?;
        Ok(store.get(&location).await?.bytes().await?)
    }

    /// Paths of every blob under `prefix`, sorted.
    pub async fn list_blobs(&self, container: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let store = self.open(container).await?;
        let prefix = parse_path(prefix)?;
        let mut paths: Vec<String> = store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        paths.sort();
        Ok(paths)
    }
}

/// List the container root to prove it exists and is reachable.
async fn check_container<S: ObjectStore>(store: S, container: &str) -> Result<S, StorageError> {
    match store.list_with_delimiter(None).await {
        Ok(_) => Ok(store),
        Err(e) => Err(StorageError::ContainerUnavailable {
            container: container.to_string(),
            message: e.to_string(),
        }),
    }
}

fn parse_path(path: &str) -> Result<Path, StorageError> {
    Path::parse(path).map_err(|e| StorageError::InvalidPath {
        path: path.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl BlobStore for ObjectStoreBlobs {
    async fn ensure_container(&self, container: &str) -> Result<(), StorageError> {
        self.open(container).await.map(|_| ())
    }

    async fn put_blob(&self, container: &str, path: &str, data: Bytes) -> Result<(), StorageError> {
        let store = self.open(container).await?;
        let location = parse_path(path)?;
        let size = data.len();
        store.put(&location, PutPayload::from(data)).await?;
        debug!(container = %container, path = %path, size, "Wrote blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_overwrites() {
        let blobs = ObjectStoreBlobs::in_memory();
        blobs.ensure_container("diagnostics").await.unwrap();

        blobs
            .put_blob("diagnostics", "b1/x.log", Bytes::from_static(b"first"))
            .await
            .unwrap();
        blobs
            .put_blob("diagnostics", "b1/x.log", Bytes::from_static(b"second"))
            .await
            .unwrap();

        let data = blobs.read_blob("diagnostics", "b1/x.log").await.unwrap();
        assert_eq!(&data[..], b"second");
        assert_eq!(
            blobs.list_blobs("diagnostics", "b1").await.unwrap(),
            vec!["b1/x.log".to_string()]
        );
    }

    #[tokio::test]
    async fn test_containers_are_isolated() {
        let blobs = ObjectStoreBlobs::in_memory();
        blobs
            .put_blob("a", "same/path", Bytes::from_static(b"in a"))
            .await
            .unwrap();

        assert!(blobs.read_blob("b", "same/path").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_azure_container_is_reported() {
        use wiremock::matchers::any;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<?xml version=\"1.0\"?><Error><Code>ContainerNotFound</Code></Error>",
            ))
            .mount(&server)
            .await;

        let store = MicrosoftAzureBuilder::new()
            .with_account("devstoreaccount1")
            .with_access_key(
                "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==",
            )
            .with_container_name("diagnostics")
            .with_endpoint(server.uri())
            .with_allow_http(true)
            .build()
            .unwrap();

        let err = check_container(store, "diagnostics").await.unwrap_err();

        assert!(matches!(
            err,
            StorageError::ContainerUnavailable { ref container, .. } if container == "diagnostics"
        ));
    }

    #[tokio::test]
    async fn test_local_backend_creates_container_directory() {
        let root = std::env::temp_dir().join(format!("calcbridge-blobs-{}", std::process::id()));
        let blobs = ObjectStoreBlobs::new(StorageBackend::Local { root: root.clone() });

        blobs.ensure_container("diagnostics").await.unwrap();
        blobs
            .put_blob("diagnostics", "b1/20260101T000000Z/logs/p/c.log", Bytes::from("hi"))
            .await
            .unwrap();

        assert!(root
            .join("diagnostics/b1/20260101T000000Z/logs/p/c.log")
            .is_file());
        let _ = std::fs::remove_dir_all(root);
    }
}
