//! Execution backend seam: submit, observe and cancel build jobs
//!
//! The reconciler only depends on [`ExecutionBackend`]. [`JobBackend`] runs a
//! strategy as a Kubernetes `batch/v1` Job; tests script their own backends.

pub mod job;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub use job::JobBackend;

/// Termination message keys a step uses to report results
pub const RESULT_IMAGE_DIGEST: &str = "image-digest";
pub const RESULT_IMAGE_SIZE: &str = "image-size";
pub const RESULT_COMMIT_SHA: &str = "commit-sha";
pub const RESULT_COMMIT_AUTHOR: &str = "commit-author";
pub const RESULT_BRANCH_NAME: &str = "branch-name";
/// Failure reason a step may report for itself
pub const RESULT_REASON: &str = "reason";
pub const RESULT_MESSAGE: &str = "message";

/// One container of the job, run in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStep {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Secret mounted into every step
#[derive(Debug, Clone, PartialEq)]
pub struct JobVolume {
    pub name: String,
    pub secret_name: String,
    pub mount_path: String,
}

/// Backend-neutral description of the work for one BuildRun
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSpec {
    /// Deterministic name derived from the BuildRun
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Controller reference back to the BuildRun
    pub owner: Option<OwnerReference>,
    pub service_account: Option<String>,
    pub steps: Vec<JobStep>,
    pub volumes: Vec<JobVolume>,
    pub timeout_seconds: u64,
}

impl JobSpec {
    #[must_use]
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Outcome of a single step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub name: String,
    pub exit_code: Option<i32>,
    /// Reason reported by the engine (`Error`, `OOMKilled`, ...) or by the step itself
    pub reason: Option<String>,
    pub message: Option<String>,
    /// Raw termination output of the step
    pub output: String,
}

impl StepResult {
    #[must_use]
    pub fn failed(&self) -> bool {
        self.exit_code.is_some_and(|code| code != 0)
    }
}

/// Results reported by steps through their termination messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutputs {
    pub image_digest: Option<String>,
    pub image_size: Option<i64>,
    pub commit_sha: Option<String>,
    pub commit_author: Option<String>,
    pub branch_name: Option<String>,
}

impl StepOutputs {
    /// Merge the results found in a step's termination message
    pub fn absorb(&mut self, values: &BTreeMap<String, String>) {
        let take = |key: &str| values.get(key).filter(|v| !v.is_empty()).cloned();
        if let Some(digest) = take(RESULT_IMAGE_DIGEST) {
            self.image_digest = Some(digest);
        }
        if let Some(size) = take(RESULT_IMAGE_SIZE).and_then(|size| size.parse().ok()) {
            self.image_size = Some(size);
        }
        if let Some(sha) = take(RESULT_COMMIT_SHA) {
            self.commit_sha = Some(sha);
        }
        if let Some(author) = take(RESULT_COMMIT_AUTHOR) {
            self.commit_author = Some(author);
        }
        if let Some(branch) = take(RESULT_BRANCH_NAME) {
            self.branch_name = Some(branch);
        }
    }
}

/// Termination message formats: a JSON object or a list of `{key, value}` pairs
#[derive(Deserialize)]
#[serde(untagged)]
enum TerminationMessage {
    Map(BTreeMap<String, String>),
    Pairs(Vec<TerminationPair>),
}

#[derive(Deserialize)]
struct TerminationPair {
    key: String,
    value: String,
}

/// Parse the key/value results a step wrote to its termination message
#[must_use]
pub fn parse_termination_message(message: &str) -> Option<BTreeMap<String, String>> {
    match serde_json::from_str::<TerminationMessage>(message.trim()).ok()? {
        TerminationMessage::Map(values) => Some(values),
        TerminationMessage::Pairs(pairs) => Some(
            pairs
                .into_iter()
                .map(|pair| (pair.key, pair.value))
                .collect(),
        ),
    }
}

/// Snapshot of a job as seen by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub state: JobState,
    pub steps: Vec<StepResult>,
    /// Job-level reason, when the engine gives one
    pub reason: Option<String>,
    pub message: Option<String>,
    /// The job's pod was evicted from its node
    pub evicted: bool,
    /// The engine stopped the job at its deadline
    pub deadline_exceeded: bool,
    pub results: StepOutputs,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("job {0} already exists")]
    AlreadyExists(String),

    /// Worth retrying: API unavailable, throttled or over quota
    #[error("transient submission failure: {0}")]
    Transient(String),

    /// The engine refused the job; retrying the same descriptor will not help
    #[error("job rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("execution backend unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError>;

    async fn observe(&self, handle: &JobHandle) -> Result<Observation, BackendError>;

    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_message_accepts_map_and_pairs() {
        let map = parse_termination_message(r#"{"image-digest":"sha256:abc","image-size":"42"}"#)
            .unwrap();
        let pairs = parse_termination_message(
            r#"[{"key":"commit-sha","value":"0123abc"},{"key":"branch-name","value":"main"}]"#,
        )
        .unwrap();

        let mut outputs = StepOutputs::default();
        outputs.absorb(&map);
        outputs.absorb(&pairs);
        assert_eq!(outputs.image_digest.as_deref(), Some("sha256:abc"));
        assert_eq!(outputs.image_size, Some(42));
        assert_eq!(outputs.commit_sha.as_deref(), Some("0123abc"));
        assert_eq!(outputs.branch_name.as_deref(), Some("main"));
    }

    #[test]
    fn plain_log_output_is_not_a_result_set() {
        assert!(parse_termination_message("fatal: repository not found").is_none());
    }
}
