//! Shared fixtures for the reconciler integration tests
//!
//! The reconcilers run against an in-memory store, a scripted execution
//! backend and a canned registry, so a whole BuildRun lifecycle can be driven
//! one reconcile at a time.

#![allow(dead_code)] // Not every test binary uses every fixture

use async_trait::async_trait;
use imagesmith::backend::{
    BackendError, ExecutionBackend, JobHandle, JobSpec, JobState, Observation, StepOutputs,
    StepResult, SubmissionError,
};
use imagesmith::crds::{
    Build, BuildReference, BuildRun, BuildRunSpec, BuildSpec, BuildStep, BuildStrategy,
    BuildStrategySpec, GitSource, Image, ImagePlatform, Source, StrategyRef,
};
use imagesmith::image_ref::ImageReference;
use imagesmith::registry::{ImageDetails, RegistryClient, RegistryError};
use imagesmith::store::MemoryStore;
use imagesmith::tasks::{reconcile_build, reconcile_build_run, Context};
use imagesmith::ControllerConfig;
use kube::runtime::controller::Action;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const NS: &str = "builds";
pub const OUTPUT_IMAGE: &str = "registry.example.com/team/app:latest";
pub const DIGEST: &str =
    "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

/// Backend whose job states are set by the test
#[derive(Default)]
pub struct FakeBackend {
    submitted: Mutex<Vec<JobSpec>>,
    existing: Mutex<HashSet<String>>,
    submit_errors: Mutex<VecDeque<SubmissionError>>,
    observation: Mutex<Observation>,
    canceled: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn submissions(&self) -> Vec<JobSpec> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.canceled.lock().unwrap().clone()
    }

    /// Fail the next submissions with these errors, in order
    pub fn fail_submissions(&self, errors: impl IntoIterator<Item = SubmissionError>) {
        self.submit_errors.lock().unwrap().extend(errors);
    }

    pub fn set_observation(&self, observation: Observation) {
        *self.observation.lock().unwrap() = observation;
    }

    pub fn succeed_with_digest(&self, digest: &str) {
        self.set_observation(Observation {
            state: JobState::Succeeded,
            results: StepOutputs {
                image_digest: Some(digest.to_string()),
                commit_sha: Some("0c9a1d2e".to_string()),
                branch_name: Some("main".to_string()),
                ..StepOutputs::default()
            },
            ..Observation::default()
        });
    }

    pub fn fail_step(&self, step: &str, exit_code: i32, output: &str) {
        self.set_observation(Observation {
            state: JobState::Failed,
            steps: vec![StepResult {
                name: step.to_string(),
                exit_code: Some(exit_code),
                output: output.to_string(),
                ..StepResult::default()
            }],
            ..Observation::default()
        });
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmissionError> {
        if let Some(err) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if !self.existing.lock().unwrap().insert(spec.name.clone()) {
            return Err(SubmissionError::AlreadyExists(spec.name.clone()));
        }
        self.submitted.lock().unwrap().push(spec.clone());
        Ok(spec.handle())
    }

    async fn observe(&self, handle: &JobHandle) -> Result<Observation, BackendError> {
        if !self.existing.lock().unwrap().contains(&handle.name) {
            return Err(BackendError::NotFound(handle.name.clone()));
        }
        Ok(self.observation.lock().unwrap().clone())
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError> {
        if !self.existing.lock().unwrap().remove(&handle.name) {
            return Err(BackendError::NotFound(handle.name.clone()));
        }
        self.canceled.lock().unwrap().push(handle.name.clone());
        Ok(())
    }
}

/// Registry answering every lookup with the same details, or with nothing
#[derive(Default)]
pub struct FakeRegistry {
    details: Mutex<Option<ImageDetails>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn publish(&self, details: ImageDetails) {
        *self.details.lock().unwrap() = Some(details);
    }

    /// References looked up so far, in order
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn resolve_digest_and_platforms(
        &self,
        image: &ImageReference,
    ) -> Result<ImageDetails, RegistryError> {
        self.lookups.lock().unwrap().push(image.to_string());
        self.details
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RegistryError::MissingDigest(image.to_string()))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<FakeBackend>,
    pub registry: Arc<FakeRegistry>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::default());
        let registry = Arc::new(FakeRegistry::default());
        let ctx = Arc::new(Context::new(
            store.clone(),
            backend.clone(),
            registry.clone(),
            Arc::new(config),
        ));
        Self {
            store,
            backend,
            registry,
            ctx,
        }
    }

    pub async fn reconcile_build(&self, name: &str) -> Action {
        let build = self.store.build(NS, name).expect("build exists");
        reconcile_build(Arc::new(build), self.ctx.clone())
            .await
            .expect("build reconcile succeeds")
    }

    pub async fn reconcile_run(&self, name: &str) -> Action {
        let run = self.store.build_run(NS, name).expect("run exists");
        reconcile_build_run(Arc::new(run), self.ctx.clone())
            .await
            .expect("run reconcile succeeds")
    }

    pub fn run(&self, name: &str) -> BuildRun {
        self.store.build_run(NS, name).expect("run exists")
    }
}

pub fn strategy(name: &str, step: &str) -> BuildStrategy {
    let mut strategy = BuildStrategy::new(
        name,
        BuildStrategySpec {
            steps: vec![BuildStep {
                name: step.to_string(),
                image: "quay.io/containers/buildah:v1.37".to_string(),
                command: vec!["buildah".to_string()],
                args: vec![
                    "bud".to_string(),
                    "--tag=$(params.output-image)".to_string(),
                    "$(params.source-context)".to_string(),
                ],
                ..BuildStep::default()
            }],
            parameters: Vec::new(),
        },
    );
    strategy.metadata.namespace = Some(NS.to_string());
    strategy
}

pub fn build_spec(strategy: &str) -> BuildSpec {
    BuildSpec {
        source: Source {
            git: GitSource {
                url: "https://github.com/example-org/sample-go".to_string(),
                revision: Some("main".to_string()),
                clone_secret: None,
            },
            context_dir: Some("source-build".to_string()),
        },
        strategy: StrategyRef {
            name: strategy.to_string(),
            kind: None,
        },
        output: Image {
            image: OUTPUT_IMAGE.to_string(),
            push_secret: None,
        },
        ..BuildSpec::default()
    }
}

pub fn build(name: &str, spec: BuildSpec) -> Build {
    let mut build = Build::new(name, spec);
    build.metadata.namespace = Some(NS.to_string());
    build
}

pub fn run_of(name: &str, build: &str) -> BuildRun {
    let mut run = BuildRun::new(
        name,
        BuildRunSpec {
            build: BuildReference {
                name: Some(build.to_string()),
                spec: None,
            },
            ..BuildRunSpec::default()
        },
    );
    run.metadata.namespace = Some(NS.to_string());
    run
}

pub fn inline_run(name: &str, spec: BuildSpec) -> BuildRun {
    let mut run = BuildRun::new(
        name,
        BuildRunSpec {
            build: BuildReference {
                name: None,
                spec: Some(spec),
            },
            ..BuildRunSpec::default()
        },
    );
    run.metadata.namespace = Some(NS.to_string());
    run
}

pub fn platforms() -> Vec<ImagePlatform> {
    vec![
        ImagePlatform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        },
        ImagePlatform {
            os: "linux".to_string(),
            architecture: "arm64".to_string(),
            variant: Some("v8".to_string()),
        },
    ]
}

/// Reason recorded in the run's failure details
pub fn failure_reason(run: &BuildRun) -> Option<String> {
    run.status
        .as_ref()?
        .failure_details
        .as_ref()
        .map(|details| details.reason.clone())
}
