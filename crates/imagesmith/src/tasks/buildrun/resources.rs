//! Translation of a Build, a BuildRun and a resolved strategy into a [`JobSpec`]

use super::naming::ResourceNaming;
use crate::backend::{JobSpec, JobStep, JobVolume};
use crate::crds::{
    BuildRun, BuildSpec, ParamValue, LABEL_BUILD, LABEL_BUILD_RUN, LABEL_BUILD_RUN_UID,
};
use crate::failure::{Failure, FailureReason};
use crate::resolver::ResolvedStrategy;
use crate::tasks::config::BuildConfig;
use kube::{Resource, ResourceExt};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use std::time::Duration;

/// Parameters the controller supplies itself; users may not set them
pub const PARAM_SOURCE_ROOT: &str = "source-root";
pub const PARAM_SOURCE_CONTEXT: &str = "source-context";
pub const PARAM_OUTPUT_IMAGE: &str = "output-image";
pub const PARAM_DOCKERFILE: &str = "dockerfile";
pub const PARAM_BUILDER_IMAGE: &str = "builder-image";

const RESERVED_PARAMS: [&str; 5] = [
    PARAM_SOURCE_ROOT,
    PARAM_SOURCE_CONTEXT,
    PARAM_OUTPUT_IMAGE,
    PARAM_DOCKERFILE,
    PARAM_BUILDER_IMAGE,
];

/// Name of the step that clones the primary source
pub const SOURCE_STEP_NAME: &str = "source-default";

const GIT_CREDENTIALS_VOLUME: &str = "git-credentials";
const PUSH_CREDENTIALS_VOLUME: &str = "push-credentials";
const CREDENTIALS_ROOT: &str = "/workspace/credentials";
const VOLUMES_ROOT: &str = "/workspace/volumes";

fn param_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\(params\.([A-Za-z0-9_.-]+)\)").expect("Invalid regex pattern")
    })
}

/// Everything needed to describe the job of one run
pub struct JobInputs<'a> {
    pub run: &'a BuildRun,
    pub build: &'a BuildSpec,
    /// Name of the referenced Build; `None` for inlined specs
    pub build_name: Option<&'a str>,
    pub strategy: &'a ResolvedStrategy,
    pub config: &'a BuildConfig,
}

/// Run timeout, then Build timeout, then the configured default
#[must_use]
pub fn effective_timeout(run: &BuildRun, build: &BuildSpec, config: &BuildConfig) -> Duration {
    let seconds = run
        .spec
        .timeout_seconds
        .or(build.timeout_seconds)
        .filter(|seconds| *seconds > 0)
        .unwrap_or(config.default_timeout_seconds);
    Duration::from_secs(seconds)
}

fn source_context(build: &BuildSpec, config: &BuildConfig) -> String {
    match build.source.context_dir.as_deref().map(|dir| dir.trim_matches('/')) {
        Some(dir) if !dir.is_empty() => format!("{}/{dir}", config.source_root),
        _ => config.source_root.clone(),
    }
}

fn system_params(build: &BuildSpec, config: &BuildConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PARAM_SOURCE_ROOT.to_string(), config.source_root.clone()),
        (PARAM_SOURCE_CONTEXT.to_string(), source_context(build, config)),
        (PARAM_OUTPUT_IMAGE.to_string(), build.output.image.clone()),
        (
            PARAM_DOCKERFILE.to_string(),
            build.dockerfile.clone().unwrap_or_else(|| "Dockerfile".to_string()),
        ),
        (
            PARAM_BUILDER_IMAGE.to_string(),
            build
                .builder
                .as_ref()
                .map(|builder| builder.image.clone())
                .unwrap_or_default(),
        ),
    ])
}

/// Merge Build values, run overrides and strategy defaults into the final parameter set
pub fn resolve_params(
    build: &BuildSpec,
    run: &BuildRun,
    strategy: &ResolvedStrategy,
    config: &BuildConfig,
) -> Result<BTreeMap<String, String>, Failure> {
    let supplied: Vec<&ParamValue> = build
        .param_values
        .iter()
        .chain(run.spec.param_values.iter())
        .collect();

    let restricted: BTreeSet<&str> = supplied
        .iter()
        .map(|param| param.name.as_str())
        .filter(|name| RESERVED_PARAMS.contains(name))
        .collect();
    if !restricted.is_empty() {
        return Err(Failure::new(
            FailureReason::RestrictedParametersInUse,
            format!(
                "the following parameters are reserved and cannot be set: {}",
                restricted.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ));
    }

    let declared: BTreeSet<&str> = strategy
        .spec
        .parameters
        .iter()
        .map(|param| param.name.as_str())
        .collect();
    let undefined: BTreeSet<&str> = supplied
        .iter()
        .map(|param| param.name.as_str())
        .filter(|name| !declared.contains(name))
        .collect();
    if !undefined.is_empty() {
        return Err(Failure::new(
            FailureReason::UndefinedParameter,
            format!(
                "the following parameters are not defined in strategy {}: {}",
                strategy.name,
                undefined.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ));
    }

    // Later entries win: run overrides replace Build values
    let mut values: BTreeMap<String, String> = supplied
        .into_iter()
        .map(|param| (param.name.clone(), param.value.clone()))
        .collect();

    let mut missing = Vec::new();
    for param in &strategy.spec.parameters {
        if values.contains_key(&param.name) || RESERVED_PARAMS.contains(&param.name.as_str()) {
            continue;
        }
        match &param.default {
            Some(default) => {
                values.insert(param.name.clone(), default.clone());
            }
            None => missing.push(param.name.as_str()),
        }
    }
    if !missing.is_empty() {
        return Err(Failure::new(
            FailureReason::MissingParameterValues,
            format!(
                "the following parameters have no value and no default: {}",
                missing.join(", ")
            ),
        ));
    }

    values.extend(system_params(build, config));
    Ok(values)
}

/// Replace every `$(params.<name>)` with its value; unknown names are left as written
#[must_use]
pub fn substitute(input: &str, params: &BTreeMap<String, String>) -> String {
    param_pattern()
        .replace_all(input, |captures: &regex::Captures<'_>| {
            params
                .get(&captures[1])
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned()
}

fn source_steps(build: &BuildSpec, config: &BuildConfig, has_git_secret: bool) -> Vec<JobStep> {
    let git = &build.source.git;
    let mut args = vec![
        "--url".to_string(),
        git.url.clone(),
        "--target".to_string(),
        config.source_root.clone(),
    ];
    if let Some(revision) = &git.revision {
        args.extend(["--revision".to_string(), revision.clone()]);
    }
    if has_git_secret {
        args.extend([
            "--secret-path".to_string(),
            format!("{CREDENTIALS_ROOT}/{GIT_CREDENTIALS_VOLUME}"),
        ]);
    }

    let mut steps = vec![JobStep {
        name: SOURCE_STEP_NAME.to_string(),
        image: config.git_image.clone(),
        command: Vec::new(),
        args,
        env: vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
    }];

    steps.extend(build.sources.iter().map(|source| JobStep {
        name: format!("source-{}", source.name),
        image: config.git_image.clone(),
        command: Vec::new(),
        args: vec![
            "--download".to_string(),
            source.url.clone(),
            "--target".to_string(),
            format!("{}/{}", config.source_root, source.name),
        ],
        env: Vec::new(),
    }));
    steps
}

fn volumes(build: &BuildSpec) -> Vec<JobVolume> {
    let mut volumes = Vec::new();
    if let Some(secret) = &build.source.git.clone_secret {
        volumes.push(JobVolume {
            name: GIT_CREDENTIALS_VOLUME.to_string(),
            secret_name: secret.clone(),
            mount_path: format!("{CREDENTIALS_ROOT}/{GIT_CREDENTIALS_VOLUME}"),
        });
    }
    if let Some(secret) = &build.output.push_secret {
        volumes.push(JobVolume {
            name: PUSH_CREDENTIALS_VOLUME.to_string(),
            secret_name: secret.clone(),
            mount_path: format!("{CREDENTIALS_ROOT}/{PUSH_CREDENTIALS_VOLUME}"),
        });
    }
    volumes.extend(build.volumes.iter().filter_map(|volume| {
        volume.secret.as_ref().map(|secret| JobVolume {
            name: format!("volume-{}", volume.name),
            secret_name: secret.clone(),
            mount_path: format!("{VOLUMES_ROOT}/{}", volume.name),
        })
    }));
    volumes
}

fn labels(run: &BuildRun, build_name: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(LABEL_BUILD_RUN.to_string(), run.name_any())]);
    if let Some(uid) = run.uid() {
        labels.insert(LABEL_BUILD_RUN_UID.to_string(), uid);
    }
    if let Some(build_name) = build_name {
        labels.insert(LABEL_BUILD.to_string(), build_name.to_string());
    }
    labels
}

/// Service account the job runs as, if any
#[must_use]
pub fn service_account(run: &BuildRun) -> Option<String> {
    if run.wants_generated_service_account() {
        Some(ResourceNaming::service_account_name(run))
    } else {
        run.spec.service_account.clone()
    }
}

/// Describe the job executing `inputs.run`
pub fn build_job_spec(inputs: &JobInputs<'_>) -> Result<JobSpec, Failure> {
    let JobInputs {
        run,
        build,
        build_name,
        strategy,
        config,
    } = *inputs;

    let params = resolve_params(build, run, strategy, config)?;
    let mut steps = source_steps(build, config, build.source.git.clone_secret.is_some());
    steps.extend(strategy.spec.steps.iter().map(|step| JobStep {
        name: step.name.clone(),
        image: substitute(&step.image, &params),
        command: step.command.iter().map(|arg| substitute(arg, &params)).collect(),
        args: step.args.iter().map(|arg| substitute(arg, &params)).collect(),
        env: step
            .env
            .iter()
            .map(|env| (env.name.clone(), substitute(&env.value, &params)))
            .collect(),
    }));

    Ok(JobSpec {
        name: ResourceNaming::job_name(run),
        namespace: run.namespace().unwrap_or_default(),
        labels: labels(run, build_name),
        owner: run.controller_owner_ref(&()),
        service_account: service_account(run),
        steps,
        volumes: volumes(build),
        timeout_seconds: effective_timeout(run, build, config).as_secs(),
    })
}
