//! Controller configuration
//!
//! Loaded from a YAML file mounted into the controller pod. Every section has
//! defaults so a partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "IMAGESMITH_CONFIG_PATH";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace to watch; empty watches every namespace
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub retries: RetryConfig,

    #[serde(default)]
    pub requeue: RequeueConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Build execution defaults
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    /// Timeout applied when neither the BuildRun nor the Build sets one
    pub default_timeout_seconds: u64,

    /// Image of the step that clones the source repository
    pub git_image: String,

    /// Directory the source is cloned into inside the job
    pub source_root: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 600,
            git_image: "ghcr.io/imagesmith/git:latest".to_string(),
            source_root: "/workspace/source".to_string(),
        }
    }
}

/// Retry budgets for transient conditions
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Attempts at resolving a strategy that is not (yet) there
    pub strategy_lookup: u32,

    /// Attempts at submitting a job after transient errors
    pub submission: u32,

    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy_lookup: 3,
            submission: 5,
            base_backoff_seconds: 2,
            max_backoff_seconds: 60,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given (1-based) attempt, capped at the maximum
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let seconds = self
            .base_backoff_seconds
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_seconds);
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RequeueConfig {
    /// Re-check interval while a job is in flight
    pub poll_seconds: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self { poll_seconds: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Registries reached over plain HTTP (`host[:port]`)
    pub insecure_registries: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            insecure_registries: Vec::new(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl ControllerConfig {
    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.build.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "build.defaultTimeoutSeconds must be greater than zero"
            ));
        }
        if self.build.git_image.trim().is_empty() {
            return Err(anyhow::anyhow!("build.gitImage must be set"));
        }
        if !self.build.source_root.starts_with('/') {
            return Err(anyhow::anyhow!(
                "build.sourceRoot must be an absolute path, got '{}'",
                self.build.source_root
            ));
        }
        if self.retries.base_backoff_seconds > self.retries.max_backoff_seconds {
            return Err(anyhow::anyhow!(
                "retries.baseBackoffSeconds ({}) exceeds retries.maxBackoffSeconds ({})",
                self.retries.base_backoff_seconds,
                self.retries.max_backoff_seconds
            ));
        }
        if self.requeue.poll_seconds == 0 {
            return Err(anyhow::anyhow!("requeue.pollSeconds must be greater than zero"));
        }
        Ok(())
    }

    /// Load configuration from a mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Path of the configuration file: explicit value, then environment, then default
    #[must_use]
    pub fn resolve_path(explicit: Option<&str>) -> String {
        explicit
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }
}
