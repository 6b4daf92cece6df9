use super::naming::ResourceNaming;
use super::resources::{build_job_spec, effective_timeout, JobInputs};
use super::status::{mark_failed, mark_in_progress, mark_succeeded, timestamp};
use crate::backend::{BackendError, JobHandle, JobState, Observation, SubmissionError};
use crate::crds::{
    Build, BuildResults, BuildRun, BuildRunPhase, BuildRunStatus, ResolvedStrategyRef,
    SourceResult,
};
use crate::failure::{classify, Failure, FailureReason};
use crate::image_ref::ImageReference;
use crate::resolver::{resolve_ref, ResolveError};
use crate::tasks::gc;
use crate::tasks::types::{Context, Error, Result, RetryKind};
use crate::validate::{
    new_validation, validate_build, BuildReason, ValidationError, ValidationType,
};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Validators a run repeats when its Build is not registered for its current generation
const UNREGISTERED_BUILD_CHECKS: [ValidationType; 4] = [
    ValidationType::Sources,
    ValidationType::SourceUrl,
    ValidationType::Runtime,
    ValidationType::Secrets,
];

#[instrument(skip(run, ctx), fields(buildrun = %run.name_any(), namespace = %run.namespace().unwrap_or_default()))]
pub async fn reconcile_build_run(run: Arc<BuildRun>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = run.namespace().ok_or(Error::MissingObjectKey)?;
    let name = run.name_any();
    let key = format!("{namespace}/{name}");

    // The watch cache may lag behind our own writes; work from the store
    let Some(run) = ctx.store.get_build_run(&namespace, &name).await? else {
        debug!("BuildRun is gone");
        ctx.retries.forget(&key);
        return Ok(Action::await_change());
    };

    let phase = run.phase();
    if phase.is_terminal() {
        return finish_terminal(&run, &ctx, &key).await;
    }
    if run.is_cancel_requested() {
        return cancel(&run, &ctx).await;
    }
    if phase.has_job() {
        supervise(&run, &ctx, &key).await
    } else {
        prepare_and_submit(run, &ctx, &key).await
    }
}

/// Build definition a run executes
struct BuildTarget {
    build: Build,
    /// False when the run inlines its spec
    named: bool,
}

/// Load the Build a run refers to, or synthesize one from its inlined spec
async fn load_target(
    run: &BuildRun,
    ctx: &Context,
) -> Result<std::result::Result<BuildTarget, Failure>> {
    let namespace = run.namespace().unwrap_or_default();
    if let Some(build_name) = run.build_name() {
        if run.spec.build.spec.is_some() {
            return Ok(Err(Failure::new(
                FailureReason::BuildRunAmbiguousBuild,
                format!(
                    "BuildRun {} references Build {build_name} and also inlines a build spec; set only one",
                    run.name_any()
                ),
            )));
        }
        return Ok(match ctx.store.get_build(&namespace, build_name).await? {
            Some(build) => Ok(BuildTarget { build, named: true }),
            None => Err(Failure::new(
                FailureReason::BuildNotFound,
                format!("Build {build_name} not found in namespace {namespace}"),
            )),
        });
    }

    match &run.spec.build.spec {
        Some(spec) => {
            let mut build = Build::new(&run.name_any(), spec.clone());
            build.metadata.namespace = Some(namespace);
            Ok(Ok(BuildTarget {
                build,
                named: false,
            }))
        }
        None => Ok(Err(Failure::new(
            FailureReason::BuildNotFound,
            format!("BuildRun {} references no Build", run.name_any()),
        ))),
    }
}

/// Persist `status` unless it equals what the run already carries
async fn write_status(ctx: &Context, run: &BuildRun, status: BuildRunStatus) -> Result<BuildRun> {
    if run.status.as_ref() == Some(&status) {
        return Ok(run.clone());
    }
    let mut updated = run.clone();
    updated.status = Some(status);
    Ok(ctx.store.update_build_run_status(&updated).await?)
}

async fn fail(
    ctx: &Context,
    run: &BuildRun,
    mut status: BuildRunStatus,
    failure: Failure,
) -> Result<Action> {
    warn!(reason = %failure.reason, message = %failure.message, "BuildRun failed");
    mark_failed(&mut status, failure, Utc::now());
    write_status(ctx, run, status).await?;
    // The status write triggers the terminal pass
    Ok(Action::await_change())
}

fn current_status(run: &BuildRun) -> BuildRunStatus {
    run.status.clone().unwrap_or_default()
}

async fn prepare_and_submit(run: BuildRun, ctx: &Context, key: &str) -> Result<Action> {
    let now = Utc::now();
    let namespace = run.namespace().unwrap_or_default();

    let target = match load_target(&run, ctx).await? {
        Ok(target) => target,
        Err(failure) => return fail(ctx, &run, current_status(&run), failure).await,
    };
    let build = &target.build;

    let run = if target.named {
        match gc::ensure_owner_reference(&run, build) {
            Some(adopted) => {
                debug!(build = %build.name_any(), "Adopting BuildRun");
                ctx.store.update_build_run_metadata(&adopted).await?
            }
            None => run,
        }
    } else {
        run
    };

    let mut status = current_status(&run);
    mark_in_progress(&mut status, BuildRunPhase::Validating, "Validating the Build", now);

    if !target.named || !build.is_registered() {
        match validate_build(&UNREGISTERED_BUILD_CHECKS, build, ctx.store.reader(), &ctx.scheme).await
        {
            Ok(()) => {}
            Err(ValidationError::Invalid { reason, message }) => {
                let failure = Failure::new(FailureReason::Build(reason), message);
                return fail(ctx, &run, status, failure).await;
            }
            Err(ValidationError::Lookup(err)) => return Err(err.into()),
        }
    }

    if target.named {
        let check = new_validation(
            ValidationType::OwnerReferences,
            build,
            ctx.store.reader(),
            &ctx.scheme,
        );
        if let Err(err) = check.validate_path().await {
            warn!(build = %build.name_any(), error = %err, "Owner references are inconsistent");
        }
    }

    mark_in_progress(&mut status, BuildRunPhase::Resolving, "Resolving the build strategy", now);
    let strategy = match resolve_ref(ctx.store.reader(), &namespace, &build.spec.strategy).await {
        Ok(strategy) => {
            ctx.retries.reset(key, RetryKind::StrategyLookup);
            strategy
        }
        Err(ResolveError::Lookup(err)) => return Err(err.into()),
        Err(err) => {
            let reason = err.reason().unwrap_or(BuildReason::BuildStrategyNotFound);
            let attempts = ctx.retries.record(key, RetryKind::StrategyLookup);
            if attempts >= ctx.config.retries.strategy_lookup {
                ctx.retries.reset(key, RetryKind::StrategyLookup);
                let failure = Failure::new(FailureReason::Build(reason), err.to_string());
                return fail(ctx, &run, status, failure).await;
            }
            let backoff = ctx.config.retries.backoff(attempts);
            info!(attempts, backoff_secs = backoff.as_secs(), error = %err, "Strategy not found yet, retrying");
            write_status(ctx, &run, status).await?;
            return Ok(Action::requeue(backoff));
        }
    };
    status.strategy = Some(ResolvedStrategyRef {
        name: strategy.name.clone(),
        scope: strategy.scope.to_string(),
    });

    let build_name = target.named.then(|| build.name_any());
    let inputs = JobInputs {
        run: &run,
        build: &build.spec,
        build_name: build_name.as_deref(),
        strategy: &strategy,
        config: &ctx.config.build,
    };
    let spec = match build_job_spec(&inputs) {
        Ok(spec) => spec,
        Err(failure) => return fail(ctx, &run, status, failure).await,
    };

    if run.wants_generated_service_account() {
        let account = ResourceNaming::service_account_name(&run);
        let owner = run.controller_owner_ref(&()).ok_or(Error::MissingObjectKey)?;
        ctx.store
            .create_service_account(&namespace, &account, owner)
            .await?;
        status.service_account_name = Some(account);
    }

    let handle = match ctx.backend.submit(&spec).await {
        Ok(handle) => handle,
        Err(SubmissionError::AlreadyExists(name)) => {
            debug!(job = %name, "Job already submitted");
            spec.handle()
        }
        Err(SubmissionError::Transient(message)) => {
            let attempts = ctx.retries.record(key, RetryKind::Submission);
            if attempts >= ctx.config.retries.submission {
                ctx.retries.reset(key, RetryKind::Submission);
                let failure = Failure::new(
                    FailureReason::FailedToCreateBuildRunPod,
                    format!(
                        "failed to submit job {} after {attempts} attempts: {message}",
                        spec.name
                    ),
                );
                return fail(ctx, &run, status, failure).await;
            }
            let backoff = ctx.config.retries.backoff(attempts);
            info!(attempts, backoff_secs = backoff.as_secs(), error = %message, "Transient submission failure, retrying");
            write_status(ctx, &run, status).await?;
            return Ok(Action::requeue(backoff));
        }
        Err(SubmissionError::Rejected(message)) => {
            let failure = Failure::new(
                FailureReason::FailedToCreateBuildRunPod,
                format!("job {} was rejected: {message}", spec.name),
            );
            return fail(ctx, &run, status, failure).await;
        }
    };
    ctx.retries.reset(key, RetryKind::Submission);

    info!(job = %handle.name, strategy = %strategy.name, scope = %strategy.scope, "Submitted build job");
    status.job_name = Some(handle.name.clone());
    status.start_time.get_or_insert_with(|| timestamp(now));
    mark_in_progress(&mut status, BuildRunPhase::Submitted, "The build job was submitted", now);
    write_status(ctx, &run, status).await?;

    let timeout = Duration::from_secs(spec.timeout_seconds);
    Ok(requeue_within(ctx, Some(timeout)))
}

fn job_handle(run: &BuildRun) -> JobHandle {
    JobHandle {
        namespace: run.namespace().unwrap_or_default(),
        name: run
            .status
            .as_ref()
            .and_then(|status| status.job_name.clone())
            .unwrap_or_else(|| ResourceNaming::job_name(run)),
    }
}

fn started_at(run: &BuildRun) -> Option<DateTime<Utc>> {
    let start = run.status.as_ref()?.start_time.as_deref()?;
    DateTime::parse_from_rfc3339(start)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// Poll interval, shortened so a deadline is re-checked as soon as it passes
fn requeue_within(ctx: &Context, remaining: Option<Duration>) -> Action {
    let poll = Duration::from_secs(ctx.config.requeue.poll_seconds);
    let wait = remaining.map_or(poll, |remaining| {
        poll.min(remaining.max(Duration::from_secs(1)))
    });
    Action::requeue(wait)
}

async fn supervise(run: &BuildRun, ctx: &Context, key: &str) -> Result<Action> {
    let now = Utc::now();
    let target = load_target(run, ctx).await?.ok();
    let handle = job_handle(run);

    let timeout = match &target {
        Some(target) => effective_timeout(run, &target.build.spec, &ctx.config.build),
        None => effective_timeout(run, &Default::default(), &ctx.config.build),
    };
    let remaining = started_at(run).map(|start| {
        let elapsed = (now - start).to_std().unwrap_or_default();
        timeout.saturating_sub(elapsed)
    });

    if remaining == Some(Duration::ZERO) {
        info!(job = %handle.name, timeout_secs = timeout.as_secs(), "BuildRun timed out");
        stop_job(ctx, &handle).await?;
        ctx.retries.forget(key);
        let failure = Failure::timeout(&run.name_any(), timeout);
        return fail(ctx, run, current_status(run), failure).await;
    }

    let observation = match ctx.backend.observe(&handle).await {
        Ok(observation) => observation,
        Err(BackendError::NotFound(name)) => {
            let failure = Failure::new(
                FailureReason::FailedToExecuteBuildRun,
                format!("the job {name} of this BuildRun no longer exists"),
            );
            return fail(ctx, run, current_status(run), failure).await;
        }
        Err(err) => return Err(err.into()),
    };

    let mut status = current_status(run);
    match observation.state {
        JobState::Pending => {
            debug!(job = %handle.name, "Job has not started yet");
            write_status(ctx, run, status).await?;
            Ok(requeue_within(ctx, remaining))
        }
        JobState::Running => {
            mark_in_progress(&mut status, BuildRunPhase::Running, "The build job is running", now);
            write_status(ctx, run, status).await?;
            Ok(requeue_within(ctx, remaining))
        }
        JobState::Succeeded => {
            let output = target.as_ref().map(|target| target.build.spec.output.image.as_str());
            match collect_results(ctx, &observation, output).await {
                Ok(results) => {
                    info!(digest = %results.image_digest, platforms = results.platforms.len(), "BuildRun succeeded");
                    mark_succeeded(&mut status, results, now);
                }
                Err(failure) => {
                    warn!(reason = %failure.reason, message = %failure.message, "BuildRun failed");
                    mark_failed(&mut status, failure, now);
                }
            }
            complete(ctx, run, status, target.as_ref(), key).await
        }
        JobState::Failed => {
            let failure = classify(&observation, None);
            warn!(reason = %failure.reason, message = %failure.message, "BuildRun failed");
            mark_failed(&mut status, failure, now);
            complete(ctx, run, status, target.as_ref(), key).await
        }
    }
}

async fn complete(
    ctx: &Context,
    run: &BuildRun,
    status: BuildRunStatus,
    target: Option<&BuildTarget>,
    key: &str,
) -> Result<Action> {
    write_status(ctx, run, status).await?;
    ctx.retries.forget(key);

    if let Some(target) = target.filter(|target| target.named) {
        if let Err(err) = gc::prune_to_limits(ctx.store.as_ref(), &target.build).await {
            warn!(build = %target.build.name_any(), error = %err, "Failed to apply run limits");
        }
    }
    Ok(Action::await_change())
}

/// Results of a successful job; a job that reports no digest anywhere has failed
async fn collect_results(
    ctx: &Context,
    observation: &Observation,
    output_image: Option<&str>,
) -> std::result::Result<BuildResults, Failure> {
    let produced = &observation.results;
    let step_digest = produced
        .image_digest
        .clone()
        .filter(|digest| !digest.is_empty());

    let mut registry_error = None;
    let details = match output_image.map(ImageReference::parse) {
        Some(Ok(image)) => {
            // Query the manifest the step pushed, not the current target of the tag
            let image = match &step_digest {
                Some(digest) => ImageReference {
                    digest: Some(digest.clone()),
                    ..image
                },
                None => image,
            };
            match ctx.registry.resolve_digest_and_platforms(&image).await {
                Ok(details) => Some(details),
                Err(err) => {
                    warn!(image = %image, error = %err, "Registry lookup failed, keeping partial results");
                    registry_error = Some(err.to_string());
                    None
                }
            }
        }
        Some(Err(err)) => {
            registry_error = Some(err.to_string());
            None
        }
        None => None,
    };
    let details = match (details, &step_digest) {
        (Some(details), Some(digest)) if details.digest != *digest => {
            warn!(
                reported = %digest,
                registry = %details.digest,
                "Registry describes a different manifest, dropping its size and platforms"
            );
            None
        }
        (details, _) => details,
    };

    let digest = step_digest
        .or_else(|| details.as_ref().map(|details| details.digest.clone()))
        .filter(|digest| !digest.is_empty());

    let Some(image_digest) = digest else {
        let mut message = "the build job succeeded but reported no image digest".to_string();
        if let Some(registry_error) = registry_error {
            message.push_str(&format!("; registry: {registry_error}"));
        }
        return Err(Failure::new(FailureReason::FailedToExecuteBuildRun, message));
    };

    Ok(BuildResults {
        image_digest,
        image_size: produced
            .image_size
            .or_else(|| details.as_ref().and_then(|details| details.size)),
        platforms: details.map(|details| details.platforms).unwrap_or_default(),
        source: produced.commit_sha.clone().map(|commit_sha| SourceResult {
            commit_sha,
            commit_author: produced.commit_author.clone(),
            branch_name: produced.branch_name.clone(),
        }),
    })
}

/// Ask the backend to stop a job; one that is already gone is fine
async fn stop_job(ctx: &Context, handle: &JobHandle) -> Result<()> {
    match ctx.backend.cancel(handle).await {
        Ok(()) => Ok(()),
        Err(BackendError::NotFound(_)) => {
            debug!(job = %handle.name, "Job already gone");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn cancel(run: &BuildRun, ctx: &Context) -> Result<Action> {
    let has_job = run.phase().has_job()
        || run
            .status
            .as_ref()
            .is_some_and(|status| status.job_name.is_some());
    if has_job {
        let handle = job_handle(run);
        info!(job = %handle.name, "Canceling build job");
        stop_job(ctx, &handle).await?;
    }
    fail(ctx, run, current_status(run), Failure::canceled()).await
}

/// Cleanup of runs that reached a terminal phase: generated accounts and retention
async fn finish_terminal(run: &BuildRun, ctx: &Context, key: &str) -> Result<Action> {
    ctx.retries.forget(key);
    let namespace = run.namespace().unwrap_or_default();

    if let Some(account) = run
        .status
        .as_ref()
        .and_then(|status| status.service_account_name.as_deref())
    {
        ctx.store.delete_service_account(&namespace, account).await?;
    }

    let build_retention = match run.build_name() {
        Some(build_name) => ctx
            .store
            .get_build(&namespace, build_name)
            .await?
            .and_then(|build| build.spec.retention),
        None => None,
    };

    match gc::ttl_remaining(run, build_retention.as_ref(), Utc::now()) {
        Some(Duration::ZERO) => {
            info!("Deleting BuildRun after its retention TTL");
            match ctx.store.delete_build_run(&namespace, &run.name_any()).await {
                Ok(()) => Ok(Action::await_change()),
                Err(err) if err.is_not_found() => Ok(Action::await_change()),
                Err(err) => Err(err.into()),
            }
        }
        Some(remaining) => Ok(Action::requeue(remaining)),
        None => Ok(Action::await_change()),
    }
}
