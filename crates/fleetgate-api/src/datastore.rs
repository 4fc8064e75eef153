//! Persistence boundary
//!
//! The object store and file store are external collaborators; the control
//! plane core only needs these narrow contracts. The in-memory and local
//! filesystem implementations back the default wiring and tests.

use async_trait::async_trait;
use fleetgate_types::{EdgeJob, EdgeJobId, Endpoint, EndpointId};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("storage failure: {0}")]
    Internal(String),
}

/// Object store contract for the records this core touches.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>, StoreError>;
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;
    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError>;
    async fn edge_job(&self, id: EdgeJobId) -> Result<Option<EdgeJob>, StoreError>;
    async fn update_edge_job(&self, job: EdgeJob) -> Result<(), StoreError>;
}

/// File store contract for uploaded job logs.
#[async_trait]
pub trait FileService: Send + Sync {
    async fn store_edge_job_log(
        &self,
        job_id: EdgeJobId,
        endpoint_id: EndpointId,
        content: &[u8],
    ) -> Result<(), StoreError>;
}

/// In-memory object store. Everything is lost on restart, which matches the
/// tunnel core's own restart semantics.
#[derive(Default)]
pub struct InMemoryDataStore {
    endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
    jobs: RwLock<HashMap<EdgeJobId, EdgeJob>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.endpoints.read().await.get(&id).cloned())
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.endpoints.read().await.values().cloned().collect())
    }

    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        self.endpoints.write().await.insert(endpoint.id, endpoint);
        Ok(())
    }

    async fn edge_job(&self, id: EdgeJobId) -> Result<Option<EdgeJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_edge_job(&self, job: EdgeJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }
}

/// Job log storage on the local filesystem, laid out as
/// `<base>/edge_jobs/<job_id>/logs_<endpoint_id>`.
pub struct LocalFileService {
    base: PathBuf,
}

impl LocalFileService {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn log_path(&self, job_id: EdgeJobId, endpoint_id: EndpointId) -> PathBuf {
        self.base
            .join("edge_jobs")
            .join(job_id.to_string())
            .join(format!("logs_{}", endpoint_id))
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn store_edge_job_log(
        &self,
        job_id: EdgeJobId,
        endpoint_id: EndpointId,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.log_path(job_id, endpoint_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgate_types::{EndpointType, TlsConfig};

    fn endpoint(id: u32) -> Endpoint {
        Endpoint {
            id: EndpointId(id),
            name: format!("endpoint-{}", id),
            url: String::new(),
            endpoint_type: EndpointType::EdgeAgent,
            tls: TlsConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_round_trip() {
        let store = InMemoryDataStore::new();
        assert!(store.endpoint(EndpointId(1)).await.unwrap().is_none());

        store.upsert_endpoint(endpoint(1)).await.unwrap();
        let loaded = store.endpoint(EndpointId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.name, "endpoint-1");
        assert_eq!(store.list_endpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_file_service_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let files = LocalFileService::new(dir.path());

        files
            .store_edge_job_log(EdgeJobId(3), EndpointId(7), b"job output")
            .await
            .unwrap();

        let stored = std::fs::read(files.log_path(EdgeJobId(3), EndpointId(7))).unwrap();
        assert_eq!(stored, b"job output");
    }
}
