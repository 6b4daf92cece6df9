//! Build validators and their dispatcher
//!
//! Each concern is one [`BuildPath`] implementation bound to the Build under
//! test and a read-only [`ClusterReader`]. The set of concerns is closed:
//! [`ValidationType`] enumerates it and [`new_validation`] maps every variant
//! to exactly one validator.
//!
//! `OwnerReferences` is advisory. Its failures are reported but never stop a
//! Build from registering or a BuildRun from executing; every other concern is
//! fatal to the calling workflow.

pub mod ownerref;
pub mod runtime;
pub mod secrets;
pub mod sourceurl;
pub mod sources;
pub mod strategy;

use crate::crds::Build;
use crate::store::{ClusterReader, StoreError};
use async_trait::async_trait;
use kube::core::GroupVersionKind;
use kube::Resource;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use ownerref::OwnerRef;
pub use runtime::RuntimeRef;
pub use secrets::Credentials;
pub use sourceurl::SourceUrlRef;
pub use sources::SourcesRef;
pub use strategy::Strategy;

/// Concerns a Build can be validated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationType {
    Secrets,
    Strategies,
    SourceUrl,
    Runtime,
    Sources,
    OwnerReferences,
}

impl ValidationType {
    pub const ALL: [ValidationType; 6] = [
        Self::Secrets,
        Self::Strategies,
        Self::SourceUrl,
        Self::Runtime,
        Self::Sources,
        Self::OwnerReferences,
    ];

    /// Order in which a Build is checked before it is registered
    pub const BUILD_REGISTRATION: [ValidationType; 5] = [
        Self::Strategies,
        Self::Sources,
        Self::SourceUrl,
        Self::Runtime,
        Self::Secrets,
    ];

    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Secrets => "secrets",
            Self::Strategies => "strategy",
            Self::SourceUrl => "sourceurl",
            Self::Runtime => "runtime",
            Self::Sources => "sources",
            Self::OwnerReferences => "ownerreferences",
        }
    }

    /// Whether a failure of this concern blocks the calling workflow
    #[must_use]
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::OwnerReferences)
    }
}

impl fmt::Display for ValidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown validation type: {0}")]
pub struct UnknownValidationType(pub String);

impl FromStr for ValidationType {
    type Err = UnknownValidationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.token() == s)
            .ok_or_else(|| UnknownValidationType(s.to_string()))
    }
}

/// Build-level reasons written to `Build.status.reason` and run failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildReason {
    SpecSourceSecretRefNotFound,
    SpecOutputSecretRefNotFound,
    SpecBuilderSecretRefNotFound,
    VolumeSecretRefNotFound,
    BuildStrategyNotFound,
    ClusterBuildStrategyNotFound,
    UnknownBuildStrategyKind,
    SourceUrlInvalid,
    RuntimePathsCanNotBeEmpty,
    RuntimeImageInvalid,
    SourceNameEmpty,
    SourceNameNotUnique,
    SourceNameInvalid,
    SourceUrlNotValid,
    OwnerReferenceInconsistent,
    OutputImageInvalid,
}

impl BuildReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpecSourceSecretRefNotFound => "SpecSourceSecretRefNotFound",
            Self::SpecOutputSecretRefNotFound => "SpecOutputSecretRefNotFound",
            Self::SpecBuilderSecretRefNotFound => "SpecBuilderSecretRefNotFound",
            Self::VolumeSecretRefNotFound => "VolumeSecretRefNotFound",
            Self::BuildStrategyNotFound => "BuildStrategyNotFound",
            Self::ClusterBuildStrategyNotFound => "ClusterBuildStrategyNotFound",
            Self::UnknownBuildStrategyKind => "UnknownBuildStrategyKind",
            Self::SourceUrlInvalid => "SourceUrlInvalid",
            Self::RuntimePathsCanNotBeEmpty => "RuntimePathsCanNotBeEmpty",
            Self::RuntimeImageInvalid => "RuntimeImageInvalid",
            Self::SourceNameEmpty => "SourceNameEmpty",
            Self::SourceNameNotUnique => "SourceNameNotUnique",
            Self::SourceNameInvalid => "SourceNameInvalid",
            Self::SourceUrlNotValid => "SourceUrlNotValid",
            Self::OwnerReferenceInconsistent => "OwnerReferenceInconsistent",
            Self::OutputImageInvalid => "OutputImageInvalid",
        }
    }

    /// Strategy-not-found reasons may clear up once the strategy is created
    #[must_use]
    pub fn is_strategy_not_found(self) -> bool {
        matches!(
            self,
            Self::BuildStrategyNotFound | Self::ClusterBuildStrategyNotFound
        )
    }
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    /// The Build itself is wrong; reported to the user as-is
    #[error("{reason}: {message}")]
    Invalid { reason: BuildReason, message: String },

    /// The validator could not read what it needed
    #[error("validation lookup failed: {0}")]
    Lookup(#[from] StoreError),
}

impl ValidationError {
    pub(crate) fn invalid(reason: BuildReason, message: impl Into<String>) -> Self {
        Self::Invalid {
            reason,
            message: message.into(),
        }
    }
}

/// Group-version-kind registry used to compare owner references
#[derive(Debug, Clone)]
pub struct Scheme {
    build: GroupVersionKind,
}

impl Default for Scheme {
    fn default() -> Self {
        Self {
            build: Self::gvk_of::<Build>(),
        }
    }
}

impl Scheme {
    pub fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
        GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
    }

    #[must_use]
    pub fn build_gvk(&self) -> &GroupVersionKind {
        &self.build
    }

    /// `apiVersion` string of the Build kind
    #[must_use]
    pub fn build_api_version(&self) -> String {
        format!("{}/{}", self.build.group, self.build.version)
    }
}

/// A single validation concern bound to one Build
#[async_trait]
pub trait BuildPath: Send + Sync {
    async fn validate_path(&self) -> Result<(), ValidationError>;
}

/// Construct the validator for `kind`; only `OwnerReferences` uses the scheme
pub fn new_validation<'a>(
    kind: ValidationType,
    build: &'a Build,
    reader: &'a dyn ClusterReader,
    scheme: &'a Scheme,
) -> Box<dyn BuildPath + 'a> {
    match kind {
        ValidationType::Secrets => Box::new(Credentials { build, reader }),
        ValidationType::Strategies => Box::new(Strategy { build, reader }),
        ValidationType::SourceUrl => Box::new(SourceUrlRef { build }),
        ValidationType::Runtime => Box::new(RuntimeRef { build }),
        ValidationType::Sources => Box::new(SourcesRef { build }),
        ValidationType::OwnerReferences => Box::new(OwnerRef {
            build,
            reader,
            scheme,
        }),
    }
}

/// Construct a validator from its textual token
pub fn new_validation_from_token<'a>(
    token: &str,
    build: &'a Build,
    reader: &'a dyn ClusterReader,
    scheme: &'a Scheme,
) -> Result<Box<dyn BuildPath + 'a>, UnknownValidationType> {
    let kind = token.parse::<ValidationType>()?;
    Ok(new_validation(kind, build, reader, scheme))
}

/// Run `kinds` in order, stopping at the first failure
pub async fn validate_build(
    kinds: &[ValidationType],
    build: &Build,
    reader: &dyn ClusterReader,
    scheme: &Scheme,
) -> Result<(), ValidationError> {
    for kind in kinds {
        new_validation(*kind, build, reader, scheme)
            .validate_path()
            .await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::crds::{Build, BuildSpec, GitSource, Image, Source, StrategyRef};

    pub fn build(name: &str) -> Build {
        let mut build = Build::new(
            name,
            BuildSpec {
                source: Source {
                    git: GitSource {
                        url: "https://github.com/example-org/sample-go".to_string(),
                        ..GitSource::default()
                    },
                    context_dir: None,
                },
                strategy: StrategyRef {
                    name: "buildah".to_string(),
                    kind: None,
                },
                output: Image {
                    image: "registry.example.com/team/app:latest".to_string(),
                    push_secret: None,
                },
                ..BuildSpec::default()
            },
        );
        build.metadata.namespace = Some("builds".to_string());
        build.metadata.uid = Some("build-uid".to_string());
        build
    }
}
