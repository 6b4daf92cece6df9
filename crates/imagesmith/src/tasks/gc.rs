//! Ownership and garbage collection of BuildRuns
//!
//! BuildRuns carry a (non-controller) owner reference to their Build so the
//! platform's cascade deletion applies. Builds opting into explicit deletion
//! additionally have their runs deleted by [`delete_dependent_runs`].
//! Retention settings bound how long and how many terminal runs are kept.

use crate::crds::{Build, BuildRetention, BuildRun, BuildRunPhase, LABEL_BUILD};
use crate::store::ObjectStore;
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Owner reference from a BuildRun to its Build
#[must_use]
pub fn build_owner_reference(build: &Build) -> Option<OwnerReference> {
    build.owner_ref(&()).map(|mut owner| {
        owner.controller = Some(false);
        owner
    })
}

/// Return `run` with an owner reference and label pointing at `build`, or
/// `None` when both are already present
#[must_use]
pub fn ensure_owner_reference(run: &BuildRun, build: &Build) -> Option<BuildRun> {
    let owner = build_owner_reference(build)?;
    let build_name = build.name_any();

    let has_owner = run
        .owner_references()
        .iter()
        .any(|existing| existing.uid == owner.uid);
    let has_label = run.labels().get(LABEL_BUILD) == Some(&build_name);
    if has_owner && has_label {
        return None;
    }

    let mut updated = run.clone();
    if !has_owner {
        updated.owner_references_mut().push(owner);
    }
    updated.labels_mut().insert(LABEL_BUILD.to_string(), build_name);
    Some(updated)
}

/// Delete every BuildRun indexed under `build`; already-deleted runs count as success
pub async fn delete_dependent_runs(store: &dyn ObjectStore, build: &Build) -> Result<usize> {
    let namespace = build.namespace().unwrap_or_default();
    let build_name = build.name_any();
    let runs = store
        .list_build_runs_for_build(&namespace, &build_name)
        .await?;

    let mut deleted = 0;
    let mut errors = Vec::new();
    for run in &runs {
        let run_name = run.name_any();
        match store.delete_build_run(&namespace, &run_name).await {
            Ok(()) => {
                deleted += 1;
                debug!(buildrun = %run_name, build = %build_name, "Deleted dependent BuildRun");
            }
            Err(err) if err.is_not_found() => {
                debug!(buildrun = %run_name, "Dependent BuildRun already gone");
            }
            Err(err) => errors.push(format!("{run_name}: {err}")),
        }
    }

    if !errors.is_empty() {
        return Err(Error::CleanupError {
            build: build_name,
            failed: errors.len(),
            errors: errors.join(", "),
        });
    }

    info!(build = %build_name, deleted, "Deleted dependent BuildRuns");
    Ok(deleted)
}

fn completion_time(run: &BuildRun) -> Option<DateTime<Utc>> {
    run.status
        .as_ref()?
        .completion_time
        .as_deref()
        .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
        .map(|time| time.with_timezone(&Utc))
}

/// TTL applying to a terminal run: its own retention first, then the Build's
#[must_use]
pub fn ttl_for(run: &BuildRun, build_retention: Option<&BuildRetention>) -> Option<Duration> {
    let pick = |retention: &BuildRetention| match run.phase() {
        BuildRunPhase::Succeeded => retention.ttl_after_succeeded_seconds,
        BuildRunPhase::Failed | BuildRunPhase::Canceled => retention.ttl_after_failed_seconds,
        _ => None,
    };
    run.spec
        .retention
        .as_ref()
        .and_then(pick)
        .or_else(|| build_retention.and_then(pick))
        .map(Duration::from_secs)
}

/// Time left before a terminal run expires; `Some(ZERO)` once it is due
#[must_use]
pub fn ttl_remaining(
    run: &BuildRun,
    build_retention: Option<&BuildRetention>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let ttl = ttl_for(run, build_retention)?;
    let completed = completion_time(run)?;
    let elapsed = (now - completed).to_std().unwrap_or_default();
    Some(ttl.saturating_sub(elapsed))
}

/// Delete the oldest terminal runs of `build` beyond its succeeded/failed limits
pub async fn prune_to_limits(store: &dyn ObjectStore, build: &Build) -> Result<usize> {
    let Some(retention) = build.spec.retention.as_ref() else {
        return Ok(0);
    };
    if retention.succeeded_limit.is_none() && retention.failed_limit.is_none() {
        return Ok(0);
    }

    let namespace = build.namespace().unwrap_or_default();
    let runs = store
        .list_build_runs_for_build(&namespace, &build.name_any())
        .await?;

    let mut pruned = 0;
    for (limit, phases) in [
        (retention.succeeded_limit, &[BuildRunPhase::Succeeded][..]),
        (
            retention.failed_limit,
            &[BuildRunPhase::Failed, BuildRunPhase::Canceled][..],
        ),
    ] {
        let Some(limit) = limit else { continue };
        let mut candidates: Vec<&BuildRun> = runs
            .iter()
            .filter(|run| phases.contains(&run.phase()))
            .collect();
        if candidates.len() <= limit {
            continue;
        }

        // Newest first; everything past the limit goes
        candidates.sort_by_key(|run| std::cmp::Reverse(completion_time(run)));
        for run in &candidates[limit..] {
            match store.delete_build_run(&namespace, &run.name_any()).await {
                Ok(()) => pruned += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(buildrun = %run.name_any(), error = %err, "Failed to prune BuildRun");
                }
            }
        }
    }

    if pruned > 0 {
        info!(build = %build.name_any(), pruned, "Pruned BuildRuns beyond retention limits");
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{BuildReference, BuildRunSpec, BuildRunStatus, BuildSpec};
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn build() -> Build {
        let mut build = Build::new("app", BuildSpec::default());
        build.metadata.namespace = Some("ns".to_string());
        build.metadata.uid = Some("build-uid".to_string());
        build
    }

    fn terminal_run(name: &str, phase: BuildRunPhase, completed: DateTime<Utc>) -> BuildRun {
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
        run.metadata.namespace = Some("ns".to_string());
        run.status = Some(BuildRunStatus {
            phase,
            completion_time: Some(completed.to_rfc3339()),
            ..BuildRunStatus::default()
        });
        ensure_owner_reference(&run, &build()).unwrap()
    }

    #[test]
    fn owner_reference_is_added_once() {
        let build = build();
        let run = terminal_run("run", BuildRunPhase::Succeeded, Utc::now());
        assert!(ensure_owner_reference(&run, &build).is_none());

        let owner = &run.owner_references()[0];
        assert_eq!(owner.kind, "Build");
        assert_eq!(owner.uid, "build-uid");
        assert_eq!(owner.controller, Some(false));
        assert_eq!(run.labels().get(LABEL_BUILD).map(String::as_str), Some("app"));
    }

    #[tokio::test]
    async fn missing_runs_count_as_deleted() {
        let store = MemoryStore::new();
        store.insert_build_run(terminal_run("a", BuildRunPhase::Succeeded, Utc::now()));
        store.insert_build_run(terminal_run("b", BuildRunPhase::Failed, Utc::now()));

        assert_eq!(delete_dependent_runs(&store, &build()).await.unwrap(), 2);
        assert!(store.build_run("ns", "a").is_none());
        assert_eq!(delete_dependent_runs(&store, &build()).await.unwrap(), 0);
    }

    #[test]
    fn ttl_prefers_run_retention() {
        let now = Utc::now();
        let mut run = terminal_run("run", BuildRunPhase::Failed, now - ChronoDuration::seconds(30));
        let build_retention = BuildRetention {
            ttl_after_failed_seconds: Some(3_600),
            ..BuildRetention::default()
        };
        assert_eq!(
            ttl_remaining(&run, Some(&build_retention), now),
            Some(Duration::from_secs(3_570))
        );

        run.spec.retention = Some(BuildRetention {
            ttl_after_failed_seconds: Some(10),
            ..BuildRetention::default()
        });
        assert_eq!(ttl_remaining(&run, Some(&build_retention), now), Some(Duration::ZERO));
        assert_eq!(ttl_remaining(&run, None, now), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn limits_prune_oldest_terminal_runs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (name, age) in [("old", 300), ("mid", 200), ("new", 100)] {
            store.insert_build_run(terminal_run(
                name,
                BuildRunPhase::Succeeded,
                now - ChronoDuration::seconds(age),
            ));
        }
        store.insert_build_run(terminal_run("failed", BuildRunPhase::Failed, now));

        let mut build = build();
        build.spec.retention = Some(BuildRetention {
            succeeded_limit: Some(1),
            failed_limit: Some(1),
            ..BuildRetention::default()
        });

        assert_eq!(prune_to_limits(&store, &build).await.unwrap(), 2);
        assert!(store.build_run("ns", "new").is_some());
        assert!(store.build_run("ns", "old").is_none());
        assert!(store.build_run("ns", "mid").is_none());
        assert!(store.build_run("ns", "failed").is_some());
    }
}
