//! [`ObjectStore`] backed by the Kubernetes API server

use super::{ClusterReader, ObjectStore, StoreError};
use crate::crds::{Build, BuildRun, BuildStrategy, ClusterBuildStrategy, LABEL_BUILD};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn builds(&self, namespace: &str) -> Api<Build> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_runs(&self, namespace: &str) -> Api<BuildRun> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Translate API status codes into the store's own error classes
fn classify(err: kube::Error, kind: &'static str, name: &str) -> StoreError {
    match &err {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
            kind,
            name: name.to_string(),
        },
        _ => StoreError::Kube(err),
    }
}

#[async_trait]
impl ClusterReader for KubeStore {
    async fn get_build(&self, namespace: &str, name: &str) -> Result<Option<Build>, StoreError> {
        Ok(self.builds(namespace).get_opt(name).await?)
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?.is_some())
    }

    async fn get_build_strategy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildStrategy>, StoreError> {
        let strategies: Api<BuildStrategy> = Api::namespaced(self.client.clone(), namespace);
        Ok(strategies.get_opt(name).await?)
    }

    async fn get_cluster_build_strategy(
        &self,
        name: &str,
    ) -> Result<Option<ClusterBuildStrategy>, StoreError> {
        let strategies: Api<ClusterBuildStrategy> = Api::all(self.client.clone());
        Ok(strategies.get_opt(name).await?)
    }

    async fn list_build_runs_for_build(
        &self,
        namespace: &str,
        build_name: &str,
    ) -> Result<Vec<BuildRun>, StoreError> {
        let params = ListParams::default().labels(&format!("{LABEL_BUILD}={build_name}"));
        let runs = self.build_runs(namespace).list(&params).await?;
        Ok(runs.items)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    fn reader(&self) -> &dyn ClusterReader {
        self
    }

    async fn get_build_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildRun>, StoreError> {
        Ok(self.build_runs(namespace).get_opt(name).await?)
    }

    async fn update_build_run_status(&self, run: &BuildRun) -> Result<BuildRun, StoreError> {
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();
        let body = serde_json::to_vec(run)?;
        self.build_runs(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| classify(e, "BuildRun", &name))
    }

    async fn update_build_run_metadata(&self, run: &BuildRun) -> Result<BuildRun, StoreError> {
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();
        self.build_runs(&namespace)
            .replace(&name, &PostParams::default(), run)
            .await
            .map_err(|e| classify(e, "BuildRun", &name))
    }

    async fn delete_build_run(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.build_runs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, "BuildRun", name))?;
        debug!(buildrun = %name, namespace = %namespace, "Deleted BuildRun");
        Ok(())
    }

    async fn update_build_status(&self, build: &Build) -> Result<Build, StoreError> {
        let name = build.name_any();
        let namespace = build.namespace().unwrap_or_default();
        let body = serde_json::to_vec(build)?;
        self.builds(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| classify(e, "Build", &name))
    }

    async fn update_build_metadata(&self, build: &Build) -> Result<Build, StoreError> {
        let name = build.name_any();
        let namespace = build.namespace().unwrap_or_default();
        self.builds(&namespace)
            .replace(&name, &PostParams::default(), build)
            .await
            .map_err(|e| classify(e, "Build", &name))
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<(), StoreError> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner]),
                ..ObjectMeta::default()
            },
            ..ServiceAccount::default()
        };

        match accounts.create(&PostParams::default(), &account).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(service_account = %name, "Service account already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        match accounts.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
