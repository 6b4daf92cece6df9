//! Validating admission for Builds
//!
//! Runs the same fatal validators the Build controller runs, so a Build that
//! would never register is refused at the API server instead. A missing
//! strategy is only a warning: the Build controller keeps rechecking it, and
//! the strategy may be created after the Build.

use crate::crds::Build;
use crate::store::ClusterReader;
use crate::validate::{validate_build, BuildReason, Scheme, ValidationError, ValidationType};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

const KNOWN_STRATEGY_KINDS: [&str; 2] = ["BuildStrategy", "ClusterBuildStrategy"];

/// Outcome of reviewing one Build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub reason: Option<BuildReason>,
    pub message: String,
    /// Returned to the client alongside an admitted Build
    pub warnings: Vec<String>,
}

impl AdmissionVerdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: String::new(),
            warnings: Vec::new(),
        }
    }

    fn warn(reason: BuildReason, message: impl Into<String>) -> Self {
        Self {
            reason: Some(reason),
            warnings: vec![message.into()],
            ..Self::allow()
        }
    }

    fn deny(reason: Option<BuildReason>, message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            message: message.into(),
            warnings: Vec::new(),
        }
    }
}

fn verdict_for(result: Result<(), ValidationError>) -> AdmissionVerdict {
    match result {
        Ok(()) => AdmissionVerdict::allow(),
        Err(ValidationError::Invalid { reason, message }) => {
            AdmissionVerdict::deny(Some(reason), format!("{reason}: {message}"))
        }
        Err(err @ ValidationError::Lookup(_)) => AdmissionVerdict::deny(None, err.to_string()),
    }
}

/// Run the fatal validators against `build`
pub async fn review_build(
    build: &Build,
    reader: &dyn ClusterReader,
    scheme: &Scheme,
) -> AdmissionVerdict {
    match validate_build(&ValidationType::BUILD_REGISTRATION, build, reader, scheme).await {
        Err(ValidationError::Invalid { reason, message }) if reason.is_strategy_not_found() => {
            let rest: Vec<ValidationType> = ValidationType::BUILD_REGISTRATION
                .into_iter()
                .filter(|kind| *kind != ValidationType::Strategies)
                .collect();
            match validate_build(&rest, build, reader, scheme).await {
                Ok(()) => AdmissionVerdict::warn(
                    reason,
                    format!("{reason}: {message}; the Build registers once the strategy exists"),
                ),
                other => verdict_for(other),
            }
        }
        other => verdict_for(other),
    }
}

/// `spec.strategy.kind` as written, when it names no known kind
fn unknown_strategy_kind(object: &DynamicObject) -> Option<String> {
    let kind = object.data.pointer("/spec/strategy/kind")?.as_str()?;
    (!KNOWN_STRATEGY_KINDS.contains(&kind)).then(|| kind.to_string())
}

async fn review_request(
    request: &AdmissionRequest<DynamicObject>,
    reader: &dyn ClusterReader,
    scheme: &Scheme,
) -> AdmissionVerdict {
    let Some(object) = &request.object else {
        return AdmissionVerdict::allow();
    };

    if let Some(kind) = unknown_strategy_kind(object) {
        return AdmissionVerdict::deny(
            Some(BuildReason::UnknownBuildStrategyKind),
            format!(
                "{}: unknown strategy kind {kind}, expected one of {}",
                BuildReason::UnknownBuildStrategyKind,
                KNOWN_STRATEGY_KINDS.join(", ")
            ),
        );
    }

    let build: Build = match serde_json::to_value(object).and_then(serde_json::from_value) {
        Ok(build) => build,
        Err(err) => return AdmissionVerdict::deny(None, format!("malformed Build: {err}")),
    };
    review_build(&build, reader, scheme).await
}

/// Answer an admission review for a Build
pub async fn review(
    review: AdmissionReview<DynamicObject>,
    reader: &dyn ClusterReader,
    scheme: &Scheme,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "Invalid admission review");
            return AdmissionResponse::invalid(err.to_string()).into_review();
        }
    };

    let name = request
        .object
        .as_ref()
        .map(|object| object.name_any())
        .unwrap_or_default();
    let verdict = review_request(&request, reader, scheme).await;
    let mut response = AdmissionResponse::from(&request);
    if verdict.allowed {
        if verdict.warnings.is_empty() {
            debug!(build = %name, "Admitted Build");
        } else {
            info!(build = %name, warnings = ?verdict.warnings, "Admitted Build with warnings");
            response.warnings = Some(verdict.warnings);
        }
        response.into_review()
    } else {
        info!(build = %name, message = %verdict.message, "Denied Build");
        response.deny(verdict.message).into_review()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{BuildStrategy, BuildStrategySpec};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn admission_review(spec: serde_json::Value) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "imagesmith.dev", "version": "v1beta1", "kind": "Build"},
                "resource": {"group": "imagesmith.dev", "version": "v1beta1", "resource": "builds"},
                "name": "app",
                "namespace": "builds",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "imagesmith.dev/v1beta1",
                    "kind": "Build",
                    "metadata": {"name": "app", "namespace": "builds"},
                    "spec": spec
                },
                "dryRun": false
            }
        }))
        .unwrap()
    }

    fn spec(kind: &str, output: &str) -> serde_json::Value {
        json!({
            "source": {"git": {"url": "https://github.com/example-org/sample-go"}},
            "strategy": {"name": "buildah", "kind": kind},
            "output": {"image": output}
        })
    }

    fn store_with_strategy() -> MemoryStore {
        let store = MemoryStore::new();
        let mut strategy = BuildStrategy::new("buildah", BuildStrategySpec::default());
        strategy.metadata.namespace = Some("builds".to_string());
        store.insert_build_strategy(strategy);
        store
    }

    fn allowed(review: &AdmissionReview<DynamicObject>) -> bool {
        review.response.as_ref().is_some_and(|response| response.allowed)
    }

    #[tokio::test]
    async fn valid_build_is_admitted() {
        let store = store_with_strategy();
        let request = admission_review(spec("BuildStrategy", "registry.example.com/team/app:latest"));
        let answer = review(request, &store, &Scheme::default()).await;
        assert!(allowed(&answer));
    }

    #[tokio::test]
    async fn unknown_strategy_kind_is_denied() {
        let store = store_with_strategy();
        let request = admission_review(spec("NamespacedStrategy", "registry.example.com/team/app"));
        let answer = review(request, &store, &Scheme::default()).await;
        assert!(!allowed(&answer));
    }

    fn build_of(spec: serde_json::Value) -> Build {
        serde_json::from_value(json!({
            "apiVersion": "imagesmith.dev/v1beta1",
            "kind": "Build",
            "metadata": {"name": "app", "namespace": "builds"},
            "spec": spec
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn verdict_carries_validator_reason() {
        let store = store_with_strategy();
        let mut spec = spec("BuildStrategy", "registry.example.com/team/app");
        spec["output"]["pushSecret"] = json!("registry-creds");

        let verdict = review_build(&build_of(spec), &store, &Scheme::default()).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(BuildReason::SpecOutputSecretRefNotFound));
        assert!(verdict.message.contains("registry-creds"));
    }

    #[tokio::test]
    async fn build_applied_before_its_strategy_is_admitted_with_a_warning() {
        let store = MemoryStore::new();
        let build = build_of(spec("ClusterBuildStrategy", "registry.example.com/team/app"));

        let verdict = review_build(&build, &store, &Scheme::default()).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, Some(BuildReason::ClusterBuildStrategyNotFound));
        assert_eq!(verdict.warnings.len(), 1);
        assert!(verdict.warnings[0].contains("buildah"));

        let request = admission_review(spec("ClusterBuildStrategy", "registry.example.com/team/app"));
        let answer = review(request, &store, &Scheme::default()).await;
        let response = answer.response.unwrap();
        assert!(response.allowed);
        assert_eq!(response.warnings.map(|warnings| warnings.len()), Some(1));
    }

    #[tokio::test]
    async fn missing_strategy_does_not_hide_other_failures() {
        let store = MemoryStore::new();
        let mut spec = spec("BuildStrategy", "registry.example.com/team/app");
        spec["output"]["pushSecret"] = json!("registry-creds");

        let verdict = review_build(&build_of(spec), &store, &Scheme::default()).await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, Some(BuildReason::SpecOutputSecretRefNotFound));
    }
}
