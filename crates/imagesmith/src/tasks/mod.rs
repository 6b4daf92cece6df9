use crate::backend::JobBackend;
use crate::crds::{Build, BuildRun};
use crate::registry::HttpRegistryClient;
use crate::store::KubeStore;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod build;
pub mod buildrun;
pub mod config;
pub mod gc;
pub mod types;

pub use build::reconcile_build;
pub use buildrun::reconcile_build_run;
pub use config::ControllerConfig;
pub use types::{Context, Error, Result};

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Load the controller configuration, falling back to defaults when the file is unreadable
pub fn load_controller_config(path: &str) -> Result<ControllerConfig> {
    let config = match ControllerConfig::from_mounted_file(path) {
        Ok(config) => {
            debug!(path, "Loaded controller configuration");
            config
        }
        Err(e) => {
            warn!(path, error = %e, "Failed to load configuration, using defaults");
            ControllerConfig::default()
        }
    };

    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }
    Ok(config)
}

fn scoped_api<K>(client: &Client, namespace: &str) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), namespace)
    }
}

/// Run the Build and BuildRun controllers until both streams end
#[instrument(skip(client, config), fields(namespace = %config.namespace))]
pub async fn run_controllers(client: Client, config: ControllerConfig) -> Result<()> {
    let registry = HttpRegistryClient::new(&config.registry)
        .map_err(|e| Error::ConfigError(format!("failed to build registry client: {e}")))?;
    let context = Arc::new(Context::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(JobBackend::new(client.clone())),
        Arc::new(registry),
        Arc::new(config),
    ));

    info!("Starting Build and BuildRun controllers...");

    let build_controller_handle = tokio::spawn({
        let context = context.clone();
        let client = client.clone();
        async move { run_build_controller(client, context).await }
    });

    let build_run_controller_handle = tokio::spawn({
        let context = context.clone();
        let client = client.clone();
        async move { run_build_run_controller(client, context).await }
    });

    match tokio::try_join!(build_controller_handle, build_run_controller_handle) {
        Ok((build_result, build_run_result)) => {
            if let Err(e) = build_result {
                error!("Build controller failed: {:?}", e);
            }
            if let Err(e) = build_run_result {
                error!("BuildRun controller failed: {:?}", e);
            }
        }
        Err(e) => {
            error!("Controller task join error: {:?}", e);
        }
    }

    info!("Controllers shutting down");
    Ok(())
}

async fn log_results<K, E>(result: std::result::Result<K, E>, kind: &'static str)
where
    K: Debug,
    E: Debug,
{
    match result {
        Ok(object) => debug!(resource = ?object, "{kind} reconciliation successful"),
        Err(err) => error!(error = ?err, "{kind} reconciliation error"),
    }
}

async fn run_build_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting Build controller");

    let builds: Api<Build> = scoped_api(&client, &context.config.namespace);
    let watcher_config = Config::default().any_semantic();

    Controller::new(builds, watcher_config)
        .shutdown_on_signal()
        .run(reconcile_build, error_policy::<Build>, context)
        .for_each(|result| {
            let span = tracing::info_span!("build_reconciliation_result");
            log_results(result, "Build").instrument(span)
        })
        .await;

    info!("Build controller shutting down");
    Ok(())
}

async fn run_build_run_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting BuildRun controller");

    let build_runs: Api<BuildRun> = scoped_api(&client, &context.config.namespace);
    let jobs: Api<Job> = scoped_api(&client, &context.config.namespace);
    let watcher_config = Config::default().any_semantic();

    Controller::new(build_runs, watcher_config.clone())
        .owns(jobs, watcher_config)
        .shutdown_on_signal()
        .run(reconcile_build_run, error_policy::<BuildRun>, context)
        .for_each(|result| {
            let span = tracing::info_span!("build_run_reconciliation_result");
            log_results(result, "BuildRun").instrument(span)
        })
        .await;

    info!("BuildRun controller shutting down");
    Ok(())
}

/// Lost optimistic-concurrency races retry at once from a fresh read; everything else waits a poll interval
pub fn error_policy<K>(object: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource + DeserializeOwned,
{
    if err.is_conflict() {
        debug!(name = %object.name_any(), "Write conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    warn!(name = %object.name_any(), error = %err, "Reconciliation failed");
    Action::requeue(Duration::from_secs(ctx.config.requeue.poll_seconds))
}
