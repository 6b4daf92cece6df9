//! Declarative object store seam
//!
//! Validators and the strategy resolver only ever see [`ClusterReader`]; the
//! reconcilers and the GC manager get the full [`ObjectStore`]. Every write
//! carries the object's `resourceVersion` and fails with
//! [`StoreError::Conflict`] when it is stale, so callers re-read instead of
//! merging blind.

pub mod kubernetes;
pub mod memory;

use crate::crds::{Build, BuildRun, BuildStrategy, ClusterBuildStrategy};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use thiserror::Error;

pub use self::kubernetes::KubeStore;
pub use self::memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Conflict { .. } => true,
            StoreError::Kube(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

/// Read-only view of the cluster handed to validators
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn get_build(&self, namespace: &str, name: &str) -> Result<Option<Build>, StoreError>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError>;

    async fn get_build_strategy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildStrategy>, StoreError>;

    async fn get_cluster_build_strategy(
        &self,
        name: &str,
    ) -> Result<Option<ClusterBuildStrategy>, StoreError>;

    /// BuildRuns labelled as belonging to `build_name`
    async fn list_build_runs_for_build(
        &self,
        namespace: &str,
        build_name: &str,
    ) -> Result<Vec<BuildRun>, StoreError>;
}

/// Read-write store used by the reconcilers
#[async_trait]
pub trait ObjectStore: ClusterReader {
    /// This store as the read-only view handed to validators
    fn reader(&self) -> &dyn ClusterReader;

    async fn get_build_run(&self, namespace: &str, name: &str)
        -> Result<Option<BuildRun>, StoreError>;

    /// Replace the status subresource; `run.metadata.resource_version` must be current
    async fn update_build_run_status(&self, run: &BuildRun) -> Result<BuildRun, StoreError>;

    /// Replace labels, annotations and owner references
    async fn update_build_run_metadata(&self, run: &BuildRun) -> Result<BuildRun, StoreError>;

    async fn delete_build_run(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn update_build_status(&self, build: &Build) -> Result<Build, StoreError>;

    /// Replace labels, annotations and finalizers
    async fn update_build_metadata(&self, build: &Build) -> Result<Build, StoreError>;

    /// Create a service account; an existing one with the same name is left in place
    async fn create_service_account(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<(), StoreError>;

    /// Delete a service account; a missing one is not an error
    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
