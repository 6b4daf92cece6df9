//! Status transitions of a BuildRun
//!
//! All helpers mutate a [`BuildRunStatus`] in place; the reconciler compares
//! the result with what it read and only writes when something changed.

use crate::crds::{
    BuildResults, BuildRunCondition, BuildRunPhase, BuildRunStatus, CONDITION_SUCCEEDED,
};
use crate::failure::{Failure, FailureReason};
use chrono::{DateTime, SecondsFormat, Utc};

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

#[must_use]
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Set the `Succeeded` condition; the transition time only moves when the status value does
pub fn set_succeeded_condition(
    status: &mut BuildRunStatus,
    value: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let index = status
        .conditions
        .iter()
        .position(|condition| condition.condition_type == CONDITION_SUCCEEDED);
    let condition = match index {
        Some(index) => &mut status.conditions[index],
        None => {
            status.conditions.push(BuildRunCondition {
                condition_type: CONDITION_SUCCEEDED.to_string(),
                ..BuildRunCondition::default()
            });
            let last = status.conditions.len() - 1;
            &mut status.conditions[last]
        }
    };

    if condition.status != value || condition.last_transition_time.is_none() {
        condition.status = value.to_string();
        condition.last_transition_time = Some(timestamp(now));
    }
    condition.reason = Some(reason.to_string());
    condition.message = Some(message.to_string());
}

/// Move a non-terminal run to `phase` with `Succeeded=Unknown`
pub fn mark_in_progress(
    status: &mut BuildRunStatus,
    phase: BuildRunPhase,
    message: &str,
    now: DateTime<Utc>,
) {
    if status.phase.is_terminal() {
        return;
    }
    status.phase = phase;
    set_succeeded_condition(status, STATUS_UNKNOWN, &phase.to_string(), message, now);
}

/// Finish a run unsuccessfully
///
/// Existing failure details are kept as they are; the condition always
/// mirrors the details that end up in the status.
pub fn mark_failed(status: &mut BuildRunStatus, failure: Failure, now: DateTime<Utc>) {
    if status.phase == BuildRunPhase::Succeeded {
        return;
    }
    let canceled = failure.reason == FailureReason::BuildRunCanceled;
    let details = status
        .failure_details
        .get_or_insert_with(|| failure.into_details())
        .clone();

    if !status.phase.is_terminal() {
        status.phase = if canceled {
            BuildRunPhase::Canceled
        } else {
            BuildRunPhase::Failed
        };
    }
    status.results = None;
    set_succeeded_condition(status, STATUS_FALSE, &details.reason, &details.message, now);
    status
        .completion_time
        .get_or_insert_with(|| timestamp(now));
}

/// Finish a run successfully; callers guarantee a non-empty digest
pub fn mark_succeeded(status: &mut BuildRunStatus, results: BuildResults, now: DateTime<Utc>) {
    if status.phase.is_terminal() {
        return;
    }
    status.phase = BuildRunPhase::Succeeded;
    status.results = Some(results);
    set_succeeded_condition(
        status,
        STATUS_TRUE,
        "Succeeded",
        "All steps have completed executing",
        now,
    );
    status
        .completion_time
        .get_or_insert_with(|| timestamp(now));
}
