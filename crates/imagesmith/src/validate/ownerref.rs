use super::{BuildPath, BuildReason, Scheme, ValidationError};
use crate::crds::{Build, BuildRun};
use crate::store::ClusterReader;
use async_trait::async_trait;
use kube::ResourceExt;

/// Owner references between a Build and its BuildRuns must agree with each other
///
/// Advisory: callers log the outcome instead of failing the Build or the run.
pub struct OwnerRef<'a> {
    pub build: &'a Build,
    pub reader: &'a dyn ClusterReader,
    pub scheme: &'a Scheme,
}

impl OwnerRef<'_> {
    async fn check_run(&self, run: &BuildRun, namespace: &str) -> Result<(), ValidationError> {
        let api_version = self.scheme.build_api_version();
        let kind = &self.scheme.build_gvk().kind;
        let build_name = self.build.name_any();
        let run_name = run.name_any();

        let build_owners: Vec<_> = run
            .owner_references()
            .iter()
            .filter(|owner| owner.api_version == api_version && &owner.kind == kind)
            .collect();

        for owner in &build_owners {
            let (exists, uid) = if owner.name == build_name {
                (true, self.build.uid())
            } else {
                let other = self.reader.get_build(namespace, &owner.name).await?;
                (other.is_some(), other.and_then(|b| b.uid()))
            };
            if !exists {
                return Err(ValidationError::invalid(
                    BuildReason::OwnerReferenceInconsistent,
                    format!(
                        "BuildRun {run_name} is owned by Build {} which does not exist",
                        owner.name
                    ),
                ));
            }
            if uid.as_deref() != Some(owner.uid.as_str()) {
                return Err(ValidationError::invalid(
                    BuildReason::OwnerReferenceInconsistent,
                    format!(
                        "BuildRun {run_name} references Build {} with a stale UID {}",
                        owner.name, owner.uid
                    ),
                ));
            }
        }

        if self.build.deletes_runs_on_deletion()
            && !build_owners.iter().any(|owner| owner.name == build_name)
        {
            return Err(ValidationError::invalid(
                BuildReason::OwnerReferenceInconsistent,
                format!("BuildRun {run_name} has no owner reference to Build {build_name}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BuildPath for OwnerRef<'_> {
    async fn validate_path(&self) -> Result<(), ValidationError> {
        let namespace = self.build.namespace().unwrap_or_default();
        let runs = self
            .reader
            .list_build_runs_for_build(&namespace, &self.build.name_any())
            .await?;
        for run in &runs {
            self.check_run(run, &namespace).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{BuildReference, BuildRunSpec, ANNOTATION_BUILD_RUN_DELETION, LABEL_BUILD};
    use crate::store::MemoryStore;
    use crate::validate::test_support::build;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn run(name: &str, owner_uid: Option<&str>) -> BuildRun {
        let mut run = BuildRun::new(
            name,
            BuildRunSpec {
                build: BuildReference {
                    name: Some("app".to_string()),
                    spec: None,
                },
                ..BuildRunSpec::default()
            },
        );
        run.metadata.namespace = Some("builds".to_string());
        run.metadata.labels = Some(BTreeMap::from([(LABEL_BUILD.to_string(), "app".to_string())]));
        run.metadata.owner_references = owner_uid.map(|uid| {
            vec![OwnerReference {
                api_version: "imagesmith.dev/v1beta1".to_string(),
                kind: "Build".to_string(),
                name: "app".to_string(),
                uid: uid.to_string(),
                ..OwnerReference::default()
            }]
        });
        run
    }

    #[tokio::test]
    async fn stale_owner_uid_is_inconsistent() {
        let store = MemoryStore::new();
        let build = build("app");
        store.insert_build_run(run("good", Some("build-uid")));
        let scheme = Scheme::default();
        let validator = OwnerRef { build: &build, reader: &store, scheme: &scheme };
        assert!(validator.validate_path().await.is_ok());

        store.insert_build_run(run("stale", Some("old-uid")));
        let err = validator.validate_path().await.unwrap_err();
        assert!(err.to_string().contains("stale"));
    }

    #[tokio::test]
    async fn cascade_requires_owner_reference() {
        let store = MemoryStore::new();
        let mut build = build("app");
        store.insert_build_run(run("orphan", None));
        let scheme = Scheme::default();

        assert!(OwnerRef { build: &build, reader: &store, scheme: &scheme }
            .validate_path()
            .await
            .is_ok());

        build.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_BUILD_RUN_DELETION.to_string(),
            "true".to_string(),
        )]));
        let err = OwnerRef { build: &build, reader: &store, scheme: &scheme }
            .validate_path()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Invalid { reason: BuildReason::OwnerReferenceInconsistent, .. }
        ));
    }
}
