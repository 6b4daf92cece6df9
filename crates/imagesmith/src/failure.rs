//! Failure taxonomy and classification of execution outcomes
//!
//! [`FailureReason`] is closed; it becomes a string only when written to
//! `BuildRun.status.failureDetails`.

use crate::backend::{Observation, StepResult};
use crate::crds::FailureDetails;
use crate::git::{classify_clone_output, GitErrorClass};
use crate::validate::BuildReason;
use std::fmt;
use std::time::Duration;

/// Message used when a run is canceled on request
pub const CANCELED_MESSAGE: &str = "The user requested the BuildRun to be canceled";

/// Container termination reasons that say nothing beyond "it failed"
const GENERIC_STEP_REASONS: &[&str] = &[
    "",
    "Error",
    "Completed",
    "ContainerStatusUnknown",
    "DeadlineExceeded",
];

const OUTPUT_TAIL_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Source retrieval failed in a recognized way
    Git(GitErrorClass),
    /// A step failed with a reason the engine named; passed through verbatim
    ExecutionReported(String),
    PodEvicted,
    BuildRunTimeout,
    BuildRunCanceled,
    FailedToCreateBuildRunPod,
    FailedToExecuteBuildRun,
    /// The Build (or the run's inlined spec) failed validation
    Build(BuildReason),
    BuildNotFound,
    /// The run names a Build and also inlines a spec
    BuildRunAmbiguousBuild,
    UndefinedParameter,
    RestrictedParametersInUse,
    MissingParameterValues,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Git(class) => class.as_str(),
            Self::ExecutionReported(reason) => reason,
            Self::PodEvicted => "PodEvicted",
            Self::BuildRunTimeout => "BuildRunTimeout",
            Self::BuildRunCanceled => "BuildRunCanceled",
            Self::FailedToCreateBuildRunPod => "FailedToCreateBuildRunPod",
            Self::FailedToExecuteBuildRun => "FailedToExecuteBuildRun",
            Self::Build(reason) => reason.as_str(),
            Self::BuildNotFound => "BuildNotFound",
            Self::BuildRunAmbiguousBuild => "BuildRunAmbiguousBuild",
            Self::UndefinedParameter => "UndefinedParameter",
            Self::RestrictedParametersInUse => "RestrictedParametersInUse",
            Self::MissingParameterValues => "MissingParameterValues",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified terminal failure of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn canceled() -> Self {
        Self::new(FailureReason::BuildRunCanceled, CANCELED_MESSAGE)
    }

    #[must_use]
    pub fn timeout(run_name: &str, timeout: Duration) -> Self {
        Self::new(
            FailureReason::BuildRunTimeout,
            format!(
                "BuildRun {run_name} failed to finish within {}s",
                timeout.as_secs()
            ),
        )
    }

    #[must_use]
    pub fn into_details(self) -> FailureDetails {
        FailureDetails {
            reason: self.reason.as_str().to_string(),
            message: self.message,
        }
    }
}

fn tail(output: &str) -> &str {
    let output = output.trim();
    match output.char_indices().rev().nth(OUTPUT_TAIL_CHARS - 1) {
        Some((index, _)) => &output[index..],
        None => output,
    }
}

fn git_signal(steps: &[StepResult]) -> Option<GitErrorClass> {
    let classes: Vec<GitErrorClass> = steps
        .iter()
        .filter_map(|step| {
            step.reason
                .as_deref()
                .and_then(GitErrorClass::from_reason)
                .or_else(|| {
                    step.failed()
                        .then(|| classify_clone_output(&step.output))
                        .flatten()
                })
        })
        .collect();

    classes
        .iter()
        .copied()
        .find(|class| *class == GitErrorClass::AuthPrompted)
        .or_else(|| classes.first().copied())
}

fn named_step_failure(steps: &[StepResult]) -> Option<Failure> {
    steps.iter().find_map(|step| {
        let reason = step.reason.as_deref()?;
        if !step.failed() || GENERIC_STEP_REASONS.contains(&reason) {
            return None;
        }
        let message = step.message.clone().unwrap_or_else(|| {
            format!(
                "step {} failed with reason {reason} (exit code {})",
                step.name,
                step.exit_code.unwrap_or_default()
            )
        });
        Some(Failure::new(
            FailureReason::ExecutionReported(reason.to_string()),
            message,
        ))
    })
}

/// Map a failed execution to exactly one [`Failure`]
///
/// Priority: git signals (a credential prompt above all), then a reason named
/// by a failing step, then infrastructure signals, then the generic fallback.
/// A registry error only ever contributes to the fallback message.
#[must_use]
pub fn classify(observation: &Observation, registry_error: Option<&str>) -> Failure {
    if let Some(class) = git_signal(&observation.steps) {
        return Failure::new(FailureReason::Git(class), class.to_message());
    }

    if let Some(failure) = named_step_failure(&observation.steps) {
        return failure;
    }

    if observation.evicted {
        let detail = observation
            .message
            .clone()
            .unwrap_or_else(|| "the node was under resource pressure".to_string());
        return Failure::new(
            FailureReason::PodEvicted,
            format!("The BuildRun pod was evicted: {detail}"),
        );
    }

    if observation.deadline_exceeded {
        return Failure::new(
            FailureReason::BuildRunTimeout,
            observation
                .message
                .clone()
                .unwrap_or_else(|| "The BuildRun exceeded its deadline".to_string()),
        );
    }

    let mut message = match observation.steps.iter().find(|step| step.failed()) {
        Some(step) => {
            let mut message = format!(
                "step {} failed with exit code {}",
                step.name,
                step.exit_code.unwrap_or_default()
            );
            let output = tail(&step.output);
            if !output.is_empty() {
                message.push_str(": ");
                message.push_str(output);
            }
            message
        }
        None => observation
            .message
            .clone()
            .unwrap_or_else(|| "The BuildRun failed without reporting a failed step".to_string()),
    };
    if let Some(registry_error) = registry_error {
        message.push_str(&format!("; registry: {registry_error}"));
    }
    Failure::new(FailureReason::FailedToExecuteBuildRun, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JobState;
    use crate::git::AUTH_PROMPTED_MESSAGE;

    fn failed_step(name: &str, reason: Option<&str>, output: &str) -> StepResult {
        StepResult {
            name: name.to_string(),
            exit_code: Some(1),
            reason: reason.map(str::to_string),
            message: None,
            output: output.to_string(),
        }
    }

    fn failed(steps: Vec<StepResult>) -> Observation {
        Observation {
            state: JobState::Failed,
            steps,
            ..Observation::default()
        }
    }

    #[test]
    fn auth_prompt_wins_over_everything() {
        let mut observation = failed(vec![
            failed_step("source-default", Some("Error"), "fatal: could not read Username for 'https://github.com': terminal prompts disabled"),
            failed_step("build-and-push", Some("OOMKilled"), ""),
        ]);
        observation.evicted = true;

        let failure = classify(&observation, Some("manifest unknown"));
        assert_eq!(failure.reason, FailureReason::Git(GitErrorClass::AuthPrompted));
        assert_eq!(failure.message, AUTH_PROMPTED_MESSAGE);
        assert_eq!(failure.into_details().reason, "AuthPrompted");
    }

    #[test]
    fn named_step_reason_passes_through_before_infra() {
        let mut observation = failed(vec![failed_step("build-and-push", Some("OOMKilled"), "")]);
        observation.evicted = true;

        let failure = classify(&observation, None);
        assert_eq!(
            failure.reason,
            FailureReason::ExecutionReported("OOMKilled".to_string())
        );
        assert_eq!(failure.reason.as_str(), "OOMKilled");
    }

    #[test]
    fn infra_signals_classify_when_steps_are_generic() {
        let mut observation = failed(vec![failed_step("build-and-push", Some("Error"), "")]);
        observation.evicted = true;
        assert_eq!(classify(&observation, None).reason, FailureReason::PodEvicted);

        let mut observation = failed(vec![]);
        observation.deadline_exceeded = true;
        assert_eq!(classify(&observation, None).reason, FailureReason::BuildRunTimeout);
    }

    #[test]
    fn fallback_mentions_step_and_registry() {
        let observation = failed(vec![failed_step("build-and-push", Some("Error"), "error: exit status 2")]);
        let failure = classify(&observation, Some("401 Unauthorized"));
        assert_eq!(failure.reason, FailureReason::FailedToExecuteBuildRun);
        assert!(failure.message.contains("build-and-push"));
        assert!(failure.message.contains("exit status 2"));
        assert!(failure.message.ends_with("registry: 401 Unauthorized"));

        let empty = classify(&Observation::default(), None);
        assert_eq!(empty.reason, FailureReason::FailedToExecuteBuildRun);
    }

    #[test]
    fn step_reported_git_reason_is_recognized() {
        let observation = failed(vec![failed_step("source-default", Some("RevisionNotFound"), "")]);
        let failure = classify(&observation, None);
        assert_eq!(failure.reason, FailureReason::Git(GitErrorClass::RevisionNotFound));
    }

    #[test]
    fn long_output_is_truncated_to_tail() {
        let output = format!("{}END", "x".repeat(2_000));
        assert_eq!(tail(&output).len(), OUTPUT_TAIL_CHARS);
        assert!(tail(&output).ends_with("END"));
    }
}
