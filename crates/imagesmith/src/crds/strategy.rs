//! `BuildStrategy` and `ClusterBuildStrategy` Custom Resource Definitions

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Environment variable of a strategy step
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct StepEnv {
    pub name: String,
    pub value: String,
}

/// One container run by the strategy, in declaration order
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct BuildStep {
    pub name: String,
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<StepEnv>,
}

/// Parameter a strategy accepts; referenced in steps as `$(params.<name>)`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct StrategyParameter {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Value used when neither the Build nor the BuildRun sets one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// `BuildStrategy` CRD (namespaced)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "imagesmith.dev", version = "v1beta1", kind = "BuildStrategy")]
#[kube(namespaced)]
pub struct BuildStrategySpec {
    #[serde(default)]
    pub steps: Vec<BuildStep>,

    #[serde(default)]
    pub parameters: Vec<StrategyParameter>,
}

/// `ClusterBuildStrategy` CRD (cluster-scoped)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(group = "imagesmith.dev", version = "v1beta1", kind = "ClusterBuildStrategy")]
pub struct ClusterBuildStrategySpec {
    #[serde(default)]
    pub steps: Vec<BuildStep>,

    #[serde(default)]
    pub parameters: Vec<StrategyParameter>,
}

impl From<ClusterBuildStrategySpec> for BuildStrategySpec {
    fn from(spec: ClusterBuildStrategySpec) -> Self {
        Self {
            steps: spec.steps,
            parameters: spec.parameters,
        }
    }
}
