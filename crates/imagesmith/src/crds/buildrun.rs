//! `BuildRun` Custom Resource Definition: one execution of a Build

use super::build::{BuildRetention, BuildSpec, ParamValue};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `spec.state` value requesting cancellation
pub const BUILD_RUN_STATE_CANCELED: &str = "BuildRunCanceled";

/// `spec.serviceAccount` value requesting a generated service account
pub const GENERATE_SERVICE_ACCOUNT: &str = ".generate";

/// Condition type carrying the outcome of a run
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// Reference to the Build executed by this run: by name, or inlined
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct BuildReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<BuildSpec>,
}

/// `BuildRun` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "imagesmith.dev", version = "v1beta1", kind = "BuildRun")]
#[kube(namespaced)]
#[kube(status = "BuildRunStatus")]
#[kube(printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].status"}"#)]
#[kube(printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct BuildRunSpec {
    pub build: BuildReference,

    /// Parameter overrides, applied on top of the Build's values
    #[serde(default, rename = "paramValues")]
    pub param_values: Vec<ParamValue>,

    /// Service account for the job pods; `.generate` creates one per run
    #[serde(default, rename = "serviceAccount", skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    #[serde(default, rename = "timeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Desired state; `BuildRunCanceled` requests cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<BuildRetention>,
}

/// Lifecycle phase of a run
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum BuildRunPhase {
    #[default]
    Pending,
    Validating,
    Resolving,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl BuildRunPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Phases in which an execution job is expected to exist
    #[must_use]
    pub fn has_job(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl std::fmt::Display for BuildRunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            Self::Pending => "Pending",
            Self::Validating => "Validating",
            Self::Resolving => "Resolving",
            Self::Submitted => "Submitted",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        };
        f.write_str(phase)
    }
}

/// Terminal explanation of a non-successful run
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct FailureDetails {
    pub reason: String,
    pub message: String,
}

/// Platform of a published image
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub struct ImagePlatform {
    pub os: String,
    pub architecture: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Source revision that was built
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SourceResult {
    #[serde(rename = "commitSha")]
    pub commit_sha: String,

    #[serde(default, rename = "commitAuthor", skip_serializing_if = "Option::is_none")]
    pub commit_author: Option<String>,

    #[serde(default, rename = "branchName", skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

/// Results of a successful run
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct BuildResults {
    #[serde(rename = "imageDigest")]
    pub image_digest: String,

    #[serde(default, rename = "imageSize", skip_serializing_if = "Option::is_none")]
    pub image_size: Option<i64>,

    #[serde(default)]
    pub platforms: Vec<ImagePlatform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceResult>,
}

/// Strategy the run was resolved against
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ResolvedStrategyRef {
    pub name: String,
    /// `Namespace` or `Cluster`
    pub scope: String,
}

/// Standard condition entry
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    /// True, False or Unknown
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status of the `BuildRun`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunStatus {
    #[serde(default)]
    pub phase: BuildRunPhase,

    #[serde(default)]
    pub conditions: Vec<BuildRunCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_details: Option<FailureDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<BuildResults>,

    /// Name of the execution job submitted for this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Service account generated for this run, deleted once it is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolvedStrategyRef>,

    /// RFC3339 time the job was submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// RFC3339 time the run reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

impl BuildRunStatus {
    #[must_use]
    pub fn succeeded_condition(&self) -> Option<&BuildRunCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.condition_type == CONDITION_SUCCEEDED)
    }
}

impl BuildRun {
    #[must_use]
    pub fn phase(&self) -> BuildRunPhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.spec.state.as_deref() == Some(BUILD_RUN_STATE_CANCELED)
    }

    #[must_use]
    pub fn wants_generated_service_account(&self) -> bool {
        self.spec.service_account.as_deref() == Some(GENERATE_SERVICE_ACCOUNT)
    }

    /// Name of the referenced Build, if the run does not inline its spec
    #[must_use]
    pub fn build_name(&self) -> Option<&str> {
        self.spec.build.name.as_deref()
    }
}
