//! `Build` Custom Resource Definition: the declared, reusable build intent

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation that opts a Build into explicit deletion of its BuildRuns
pub const ANNOTATION_BUILD_RUN_DELETION: &str = "imagesmith.dev/build-run-deletion";

/// Git source of the build
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct GitSource {
    /// Repository URL (https://, ssh://, git:// or scp-like `git@host:org/repo`)
    pub url: String,

    /// Branch, tag or commit to build (defaults to the remote HEAD)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Secret holding clone credentials
    #[serde(default, rename = "cloneSecret", skip_serializing_if = "Option::is_none")]
    pub clone_secret: Option<String>,
}

/// Primary source of the build
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Source {
    pub git: GitSource,

    /// Sub-directory of the repository used as build context
    #[serde(default, rename = "contextDir", skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
}

/// Additional named source downloaded next to the primary source
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct NamedSource {
    /// Name, unique within `spec.sources`
    pub name: String,

    /// HTTP(S) location of the artifact
    pub url: String,
}

/// Scope of a referenced build strategy
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum BuildStrategyKind {
    /// Namespaced `BuildStrategy`
    BuildStrategy,
    /// Cluster-scoped `ClusterBuildStrategy`
    ClusterBuildStrategy,
}

/// Reference to the strategy that performs the build
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct StrategyRef {
    pub name: String,

    /// Scope to look in; when omitted the namespace is searched before the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BuildStrategyKind>,
}

/// Value for a strategy parameter
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ParamValue {
    pub name: String,
    pub value: String,
}

/// Image reference plus the secret used to push or pull it
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Image {
    pub image: String,

    #[serde(default, rename = "pushSecret", skip_serializing_if = "Option::is_none")]
    pub push_secret: Option<String>,
}

/// Runtime base image override (multi-stage "lean" image)
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Runtime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Image>,

    /// Paths copied from the builder image into the runtime image
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default, rename = "workDir", skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    #[serde(default)]
    pub entrypoint: Vec<String>,
}

/// Volume mounted into the build steps
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct BuildVolume {
    pub name: String,

    /// Secret backing the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Cleanup policy for BuildRuns of a Build
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct BuildRetention {
    #[serde(default, rename = "ttlAfterSucceededSeconds", skip_serializing_if = "Option::is_none")]
    pub ttl_after_succeeded_seconds: Option<u64>,

    #[serde(default, rename = "ttlAfterFailedSeconds", skip_serializing_if = "Option::is_none")]
    pub ttl_after_failed_seconds: Option<u64>,

    /// Number of succeeded BuildRuns to keep
    #[serde(default, rename = "succeededLimit", skip_serializing_if = "Option::is_none")]
    pub succeeded_limit: Option<usize>,

    /// Number of failed BuildRuns to keep
    #[serde(default, rename = "failedLimit", skip_serializing_if = "Option::is_none")]
    pub failed_limit: Option<usize>,
}

/// `Build` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "imagesmith.dev", version = "v1beta1", kind = "Build")]
#[kube(namespaced)]
#[kube(status = "BuildStatus")]
#[kube(printcolumn = r#"{"name":"Registered","type":"string","jsonPath":".status.registered"}"#)]
#[kube(printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#)]
#[kube(printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy.name"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct BuildSpec {
    pub source: Source,

    /// Additional sources
    #[serde(default)]
    pub sources: Vec<NamedSource>,

    pub strategy: StrategyRef,

    #[serde(default, rename = "paramValues")]
    pub param_values: Vec<ParamValue>,

    /// Dockerfile path relative to the context directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Builder image (for strategies that need one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<Image>,

    pub output: Image,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,

    #[serde(default)]
    pub volumes: Vec<BuildVolume>,

    #[serde(default, rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<BuildRetention>,
}

/// Status of the `Build`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct BuildStatus {
    /// "True" once every validation passed, "False" otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Build {
    /// True when the Build passed validation for its current generation
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.status.as_ref().is_some_and(|status| {
            status.registered.as_deref() == Some("True")
                && status.observed_generation == self.metadata.generation
        })
    }

    /// True when the Build carries the cascade-delete opt-in
    #[must_use]
    pub fn deletes_runs_on_deletion(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_BUILD_RUN_DELETION))
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}
