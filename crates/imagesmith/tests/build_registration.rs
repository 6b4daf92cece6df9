//! Build registration, validator selection and cascade deletion

mod common;

use common::{build, build_spec, run_of, strategy, Harness, NS};
use imagesmith::crds::{BuildStrategyKind, ANNOTATION_BUILD_RUN_DELETION, LABEL_BUILD};
use imagesmith::tasks::types::BUILD_FINALIZER_NAME;
use imagesmith::validate::{new_validation_from_token, Scheme, ValidationType};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;

fn cascading(name: &str) -> imagesmith::Build {
    let mut build = build(name, build_spec("buildah"));
    build.metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_BUILD_RUN_DELETION.to_string(),
        "true".to_string(),
    )]));
    build
}

#[tokio::test]
async fn valid_build_is_registered() {
    let h = Harness::new();
    h.store.insert_build_strategy(strategy("buildah", "build-and-push"));
    h.store.insert_build(build("app", build_spec("buildah")));

    assert_eq!(h.reconcile_build("app").await, Action::await_change());

    let build = h.store.build(NS, "app").unwrap();
    assert!(build.is_registered());
    let status = build.status.unwrap();
    assert_eq!(status.reason.as_deref(), Some("Succeeded"));
    assert_eq!(status.message.as_deref(), Some("all validations succeeded"));
}

#[tokio::test]
async fn missing_cluster_strategy_is_rechecked_later() {
    let h = Harness::new();
    let mut spec = build_spec("buildpacks-v3");
    spec.strategy.kind = Some(BuildStrategyKind::ClusterBuildStrategy);
    h.store.insert_build(build("app", spec));

    assert_eq!(
        h.reconcile_build("app").await,
        Action::requeue(Duration::from_secs(30))
    );
    let status = h.store.build(NS, "app").unwrap().status.unwrap();
    assert_eq!(status.registered.as_deref(), Some("False"));
    assert_eq!(status.reason.as_deref(), Some("ClusterBuildStrategyNotFound"));
}

#[tokio::test]
async fn invalid_source_url_is_reported() {
    let h = Harness::new();
    h.store.insert_build_strategy(strategy("buildah", "build-and-push"));
    let mut spec = build_spec("buildah");
    spec.source.git.url = "github.com/example-org/sample-go".to_string();
    h.store.insert_build(build("app", spec));

    h.reconcile_build("app").await;

    let status = h.store.build(NS, "app").unwrap().status.unwrap();
    assert_eq!(status.reason.as_deref(), Some("SourceUrlInvalid"));
}

#[tokio::test]
async fn unknown_validation_token_is_rejected() {
    let h = Harness::new();
    let build = build("app", build_spec("buildah"));
    let scheme = Scheme::default();

    let err = new_validation_from_token("dockerfile", &build, &*h.store, &scheme)
        .err()
        .expect("token is unknown");
    assert_eq!(err.0, "dockerfile");

    for kind in ValidationType::ALL {
        assert!(
            new_validation_from_token(kind.token(), &build, &*h.store, &scheme).is_ok()
        );
    }
}

#[tokio::test]
async fn finalizer_follows_the_deletion_annotation() {
    let h = Harness::new();
    h.store.insert_build_strategy(strategy("buildah", "build-and-push"));
    h.store.insert_build(cascading("app"));

    h.reconcile_build("app").await;
    let held = h.store.build(NS, "app").unwrap();
    assert!(held.finalizers().iter().any(|f| f == BUILD_FINALIZER_NAME));

    let mut opted_out = held.clone();
    opted_out.metadata.annotations = None;
    h.store.insert_build(opted_out);
    h.reconcile_build("app").await;
    assert!(h.store.build(NS, "app").unwrap().finalizers().is_empty());
}

#[tokio::test]
async fn deleting_a_cascading_build_deletes_its_runs() {
    let h = Harness::new();
    h.store.insert_build_strategy(strategy("buildah", "build-and-push"));
    h.store.insert_build(cascading("app"));
    h.reconcile_build("app").await;

    for name in ["app-run-1", "app-run-2"] {
        h.store.insert_build_run(run_of(name, "app"));
        h.reconcile_run(name).await;
        let run = h.run(name);
        assert_eq!(run.labels().get(LABEL_BUILD).map(String::as_str), Some("app"));
        let owner = &run.owner_references()[0];
        assert_eq!(owner.kind, "Build");
        assert_eq!(owner.controller, Some(false));
    }
    h.store.insert_build_run(run_of("other-run", "other"));

    h.store.delete_build(NS, "app").unwrap();
    assert!(h.store.build(NS, "app").is_some());
    h.reconcile_build("app").await;

    assert!(h.store.build(NS, "app").is_none());
    assert!(h.store.build_run(NS, "app-run-1").is_none());
    assert!(h.store.build_run(NS, "app-run-2").is_none());
    assert!(h.store.build_run(NS, "other-run").is_some());
}

#[tokio::test]
async fn deleting_a_plain_build_leaves_runs_to_owner_references() {
    let h = Harness::new();
    h.store.insert_build_strategy(strategy("buildah", "build-and-push"));
    h.store.insert_build(build("app", build_spec("buildah")));
    h.reconcile_build("app").await;
    h.store.insert_build_run(run_of("app-run-1", "app"));
    h.reconcile_run("app-run-1").await;

    h.store.delete_build(NS, "app").unwrap();

    assert!(h.store.build(NS, "app").is_none());
    assert!(h.store.build_run(NS, "app-run-1").is_some());
}
