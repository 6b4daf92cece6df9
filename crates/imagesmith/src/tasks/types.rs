use crate::backend::{BackendError, ExecutionBackend};
use crate::registry::RegistryClient;
use crate::store::{ObjectStore, StoreError};
use crate::tasks::config::ControllerConfig;
use crate::validate::Scheme;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer held on Builds that delete their BuildRuns on deletion
pub const BUILD_FINALIZER_NAME: &str = "imagesmith.dev/build-run-deletion";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Execution backend error: {0}")]
    BackendError(#[from] BackendError),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to delete {failed} dependent BuildRun(s) of Build {build}: {errors}")]
    CleanupError {
        build: String,
        failed: usize,
        errors: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// True when the reconcile lost an optimistic-concurrency race
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::StoreError(err) => err.is_conflict(),
            Self::KubeError(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Retry budgets tracked per BuildRun
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryKind {
    StrategyLookup,
    Submission,
}

/// In-memory attempt counters; a controller restart starts every budget afresh
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: DashMap<(String, RetryKind), u32>,
}

impl RetryTracker {
    /// Record one more attempt and return the total so far
    pub fn record(&self, key: &str, kind: RetryKind) -> u32 {
        let mut attempts = self.attempts.entry((key.to_string(), kind)).or_insert(0);
        *attempts += 1;
        *attempts
    }

    #[must_use]
    pub fn attempts(&self, key: &str, kind: RetryKind) -> u32 {
        self.attempts
            .get(&(key.to_string(), kind))
            .map_or(0, |attempts| *attempts)
    }

    pub fn reset(&self, key: &str, kind: RetryKind) {
        self.attempts.remove(&(key.to_string(), kind));
    }

    pub fn forget(&self, key: &str) {
        self.attempts.retain(|(run, _), _| run != key);
    }
}

/// Shared state handed to every reconcile
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub registry: Arc<dyn RegistryClient>,
    pub config: Arc<ControllerConfig>,
    pub scheme: Scheme,
    pub retries: RetryTracker,
}

impl Context {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        backend: Arc<dyn ExecutionBackend>,
        registry: Arc<dyn RegistryClient>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
            config,
            scheme: Scheme::default(),
            retries: RetryTracker::default(),
        }
    }
}
