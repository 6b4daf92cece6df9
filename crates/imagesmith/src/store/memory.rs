//! In-process [`ObjectStore`] used by tests and local dry runs
//!
//! Mirrors the API server behaviour the reconcilers depend on: every write
//! bumps `resourceVersion` and a write carrying a stale version is rejected
//! with [`StoreError::Conflict`]. Deleting a Build that still carries
//! finalizers only stamps `deletionTimestamp`; the object disappears once its
//! last finalizer is removed. Owner-reference garbage collection is not
//! simulated, so dependent objects stay until they are deleted explicitly.

use super::{ClusterReader, ObjectStore, StoreError};
use crate::crds::{Build, BuildRun, BuildStrategy, ClusterBuildStrategy, LABEL_BUILD};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::ResourceExt;
use std::sync::atomic::{AtomicU64, Ordering};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
pub struct MemoryStore {
    builds: DashMap<Key, Build>,
    build_runs: DashMap<Key, BuildRun>,
    build_strategies: DashMap<Key, BuildStrategy>,
    cluster_build_strategies: DashMap<String, ClusterBuildStrategy>,
    secrets: DashSet<Key>,
    service_accounts: DashMap<Key, OwnerReference>,
    version: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Fill in the server-populated metadata of a newly created object
    fn admit(&self, meta: &mut ObjectMeta) {
        let version = self.next_version();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        if meta.namespace.is_none() {
            meta.namespace = Some("default".to_string());
        }
        meta.generation.get_or_insert(1);
        meta.creation_timestamp.get_or_insert(Time(Utc::now()));
        meta.resource_version = Some(version);
    }

    fn check_version(
        current: &ObjectMeta,
        incoming: &ObjectMeta,
        kind: &'static str,
        name: &str,
    ) -> Result<(), StoreError> {
        if incoming.resource_version.is_some() && incoming.resource_version != current.resource_version
        {
            return Err(StoreError::Conflict {
                kind,
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn insert_build(&self, mut build: Build) -> Build {
        self.admit(&mut build.metadata);
        let namespace = build.namespace().unwrap_or_default();
        self.builds
            .insert(key(&namespace, &build.name_any()), build.clone());
        build
    }

    pub fn insert_build_run(&self, mut run: BuildRun) -> BuildRun {
        self.admit(&mut run.metadata);
        let namespace = run.namespace().unwrap_or_default();
        self.build_runs
            .insert(key(&namespace, &run.name_any()), run.clone());
        run
    }

    pub fn insert_build_strategy(&self, mut strategy: BuildStrategy) -> BuildStrategy {
        self.admit(&mut strategy.metadata);
        let namespace = strategy.namespace().unwrap_or_default();
        self.build_strategies
            .insert(key(&namespace, &strategy.name_any()), strategy.clone());
        strategy
    }

    pub fn insert_cluster_build_strategy(
        &self,
        mut strategy: ClusterBuildStrategy,
    ) -> ClusterBuildStrategy {
        self.admit(&mut strategy.metadata);
        strategy.metadata.namespace = None;
        self.cluster_build_strategies
            .insert(strategy.name_any(), strategy.clone());
        strategy
    }

    pub fn insert_secret(&self, namespace: &str, name: &str) {
        self.secrets.insert(key(namespace, name));
    }

    pub fn remove_build_strategy(&self, namespace: &str, name: &str) {
        self.build_strategies.remove(&key(namespace, name));
    }

    /// Replace a BuildRun's spec the way a user edit would, bumping its generation
    pub fn edit_build_run(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut BuildRun)) {
        if let Some(mut run) = self.build_runs.get_mut(&key(namespace, name)) {
            edit(&mut *run);
            run.metadata.generation = Some(run.metadata.generation.unwrap_or(1) + 1);
            run.metadata.resource_version = Some(self.next_version());
        }
    }

    /// Delete a Build; with finalizers present only `deletionTimestamp` is set
    pub fn delete_build(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let build_key = key(namespace, name);
        let has_finalizers = {
            let mut entry = self.builds.get_mut(&build_key).ok_or_else(|| StoreError::NotFound {
                kind: "Build",
                name: name.to_string(),
            })?;
            let has_finalizers = !entry.finalizers().is_empty();
            if has_finalizers {
                entry.metadata.deletion_timestamp = Some(Time(Utc::now()));
                entry.metadata.resource_version = Some(self.next_version());
            }
            has_finalizers
        };

        if !has_finalizers {
            self.builds.remove(&build_key);
        }
        Ok(())
    }

    #[must_use]
    pub fn build(&self, namespace: &str, name: &str) -> Option<Build> {
        self.builds.get(&key(namespace, name)).map(|b| b.clone())
    }

    #[must_use]
    pub fn build_run(&self, namespace: &str, name: &str) -> Option<BuildRun> {
        self.build_runs.get(&key(namespace, name)).map(|r| r.clone())
    }

    #[must_use]
    pub fn service_account(&self, namespace: &str, name: &str) -> Option<OwnerReference> {
        self.service_accounts
            .get(&key(namespace, name))
            .map(|owner| owner.clone())
    }
}

#[async_trait]
impl ClusterReader for MemoryStore {
    async fn get_build(&self, namespace: &str, name: &str) -> Result<Option<Build>, StoreError> {
        Ok(self.build(namespace, name))
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self.secrets.contains(&key(namespace, name)))
    }

    async fn get_build_strategy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildStrategy>, StoreError> {
        Ok(self
            .build_strategies
            .get(&key(namespace, name))
            .map(|s| s.clone()))
    }

    async fn get_cluster_build_strategy(
        &self,
        name: &str,
    ) -> Result<Option<ClusterBuildStrategy>, StoreError> {
        Ok(self.cluster_build_strategies.get(name).map(|s| s.clone()))
    }

    async fn list_build_runs_for_build(
        &self,
        namespace: &str,
        build_name: &str,
    ) -> Result<Vec<BuildRun>, StoreError> {
        Ok(self
            .build_runs
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .filter(|entry| {
                entry.labels().get(LABEL_BUILD).map(String::as_str) == Some(build_name)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn reader(&self) -> &dyn ClusterReader {
        self
    }

    async fn get_build_run(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildRun>, StoreError> {
        Ok(self.build_run(namespace, name))
    }

    async fn update_build_run_status(&self, run: &BuildRun) -> Result<BuildRun, StoreError> {
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();
        let mut stored = self
            .build_runs
            .get_mut(&key(&namespace, &name))
            .ok_or_else(|| StoreError::NotFound {
                kind: "BuildRun",
                name: name.clone(),
            })?;
        Self::check_version(&stored.metadata, &run.metadata, "BuildRun", &name)?;

        stored.status = run.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn update_build_run_metadata(&self, run: &BuildRun) -> Result<BuildRun, StoreError> {
        let name = run.name_any();
        let namespace = run.namespace().unwrap_or_default();
        let mut stored = self
            .build_runs
            .get_mut(&key(&namespace, &name))
            .ok_or_else(|| StoreError::NotFound {
                kind: "BuildRun",
                name: name.clone(),
            })?;
        Self::check_version(&stored.metadata, &run.metadata, "BuildRun", &name)?;

        stored.metadata.labels = run.metadata.labels.clone();
        stored.metadata.annotations = run.metadata.annotations.clone();
        stored.metadata.owner_references = run.metadata.owner_references.clone();
        stored.metadata.finalizers = run.metadata.finalizers.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn delete_build_run(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.build_runs
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "BuildRun",
                name: name.to_string(),
            })
    }

    async fn update_build_status(&self, build: &Build) -> Result<Build, StoreError> {
        let name = build.name_any();
        let namespace = build.namespace().unwrap_or_default();
        let mut stored = self
            .builds
            .get_mut(&key(&namespace, &name))
            .ok_or_else(|| StoreError::NotFound {
                kind: "Build",
                name: name.clone(),
            })?;
        Self::check_version(&stored.metadata, &build.metadata, "Build", &name)?;

        stored.status = build.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn update_build_metadata(&self, build: &Build) -> Result<Build, StoreError> {
        let name = build.name_any();
        let namespace = build.namespace().unwrap_or_default();
        let build_key = key(&namespace, &name);

        let (updated, release) = {
            let mut stored = self
                .builds
                .get_mut(&build_key)
                .ok_or_else(|| StoreError::NotFound {
                    kind: "Build",
                    name: name.clone(),
                })?;
            Self::check_version(&stored.metadata, &build.metadata, "Build", &name)?;

            stored.metadata.labels = build.metadata.labels.clone();
            stored.metadata.annotations = build.metadata.annotations.clone();
            stored.metadata.finalizers = build.metadata.finalizers.clone();
            stored.metadata.resource_version = Some(self.next_version());

            let release =
                stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty();
            (stored.clone(), release)
        };

        if release {
            self.builds.remove(&build_key);
        }
        Ok(updated)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        name: &str,
        owner: OwnerReference,
    ) -> Result<(), StoreError> {
        self.service_accounts
            .entry(key(namespace, name))
            .or_insert(owner);
        Ok(())
    }

    async fn delete_service_account(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.service_accounts.remove(&key(namespace, name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{BuildRunSpec, BuildSpec};
    use std::collections::BTreeMap;

    fn build(name: &str) -> Build {
        let mut build = Build::new(name, BuildSpec::default());
        build.metadata.namespace = Some("ns".to_string());
        build
    }

    #[tokio::test]
    async fn stale_status_write_conflicts() {
        let store = MemoryStore::new();
        let mut run = BuildRun::new("run", BuildRunSpec::default());
        run.metadata.namespace = Some("ns".to_string());
        let created = store.insert_build_run(run);

        let first = store.update_build_run_status(&created).await.unwrap();
        assert_ne!(first.metadata.resource_version, created.metadata.resource_version);

        let err = store.update_build_run_status(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn finalizers_hold_build_until_released() {
        let store = MemoryStore::new();
        let mut held = build("held");
        held.metadata.finalizers = Some(vec!["example.dev/hold".to_string()]);
        store.insert_build(held);

        store.delete_build("ns", "held").unwrap();
        let pending = store.build("ns", "held").unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = pending.clone();
        released.metadata.finalizers = Some(vec![]);
        store.update_build_metadata(&released).await.unwrap();
        assert!(store.build("ns", "held").is_none());
    }

    #[tokio::test]
    async fn runs_are_indexed_by_build_label() {
        let store = MemoryStore::new();
        for (name, owner) in [("a", "app"), ("b", "app"), ("c", "other")] {
            let mut run = BuildRun::new(name, BuildRunSpec::default());
            run.metadata.namespace = Some("ns".to_string());
            run.metadata.labels = Some(BTreeMap::from([(
                LABEL_BUILD.to_string(),
                owner.to_string(),
            )]));
            store.insert_build_run(run);
        }

        let mut names: Vec<String> = store
            .list_build_runs_for_build("ns", "app")
            .await
            .unwrap()
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert!(store.delete_build_run("ns", "missing").await.unwrap_err().is_not_found());
    }
}
