use crate::crds::{Build, BuildStatus};
use crate::tasks::gc;
use crate::tasks::types::{Context, Error, Result, BUILD_FINALIZER_NAME};
use crate::validate::{new_validation, validate_build, ValidationError, ValidationType};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const REGISTERED_REASON: &str = "Succeeded";
const REGISTERED_MESSAGE: &str = "all validations succeeded";

#[instrument(skip(build, ctx), fields(build = %build.name_any(), namespace = %build.namespace().unwrap_or_default()))]
pub async fn reconcile_build(build: Arc<Build>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = build.namespace().ok_or(Error::MissingObjectKey)?;
    let Some(build) = ctx.store.get_build(&namespace, &build.name_any()).await? else {
        debug!("Build is gone");
        return Ok(Action::await_change());
    };

    if build.metadata.deletion_timestamp.is_some() {
        return cleanup_build(build, &ctx).await;
    }

    let build = sync_finalizer(build, &ctx).await?;

    let verdict = validate_build(
        &ValidationType::BUILD_REGISTRATION,
        &build,
        ctx.store.reader(),
        &ctx.scheme,
    )
    .await;
    let (status, retry) = match verdict {
        Ok(()) => (
            registration_status(&build, "True", REGISTERED_REASON, REGISTERED_MESSAGE),
            false,
        ),
        Err(ValidationError::Invalid { reason, message }) => {
            info!(reason = %reason, message = %message, "Build failed validation");
            (
                registration_status(&build, "False", reason.as_str(), &message),
                reason.is_strategy_not_found(),
            )
        }
        Err(ValidationError::Lookup(err)) => return Err(err.into()),
    };

    let check = new_validation(
        ValidationType::OwnerReferences,
        &build,
        ctx.store.reader(),
        &ctx.scheme,
    );
    if let Err(err) = check.validate_path().await {
        warn!(error = %err, "Owner references of dependent BuildRuns are inconsistent");
    }

    if build.status.as_ref() != Some(&status) {
        let mut updated = build.clone();
        updated.status = Some(status);
        ctx.store.update_build_status(&updated).await?;
    }

    // A strategy created later does not trigger this Build, so look again
    if retry {
        return Ok(Action::requeue(Duration::from_secs(
            ctx.config.requeue.poll_seconds,
        )));
    }
    Ok(Action::await_change())
}

fn registration_status(build: &Build, registered: &str, reason: &str, message: &str) -> BuildStatus {
    BuildStatus {
        registered: Some(registered.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        observed_generation: build.metadata.generation,
    }
}

fn has_finalizer(build: &Build) -> bool {
    build.finalizers().iter().any(|f| f == BUILD_FINALIZER_NAME)
}

/// Hold the finalizer exactly while the cascade-delete annotation is set
async fn sync_finalizer(build: Build, ctx: &Context) -> Result<Build> {
    let wanted = build.deletes_runs_on_deletion();
    if wanted == has_finalizer(&build) {
        return Ok(build);
    }

    let mut updated = build.clone();
    if wanted {
        debug!("Adding finalizer");
        updated.finalizers_mut().push(BUILD_FINALIZER_NAME.to_string());
    } else {
        debug!("Removing finalizer");
        updated.finalizers_mut().retain(|f| f != BUILD_FINALIZER_NAME);
    }
    Ok(ctx.store.update_build_metadata(&updated).await?)
}

async fn cleanup_build(build: Build, ctx: &Context) -> Result<Action> {
    if !has_finalizer(&build) {
        return Ok(Action::await_change());
    }

    let deleted = gc::delete_dependent_runs(ctx.store.as_ref(), &build).await?;
    info!(deleted, "Released BuildRuns of deleted Build");

    let mut updated = build;
    updated.finalizers_mut().retain(|f| f != BUILD_FINALIZER_NAME);
    match ctx.store.update_build_metadata(&updated).await {
        Ok(_) => Ok(Action::await_change()),
        Err(err) if err.is_not_found() => Ok(Action::await_change()),
        Err(err) => Err(err.into()),
    }
}
