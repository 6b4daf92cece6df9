//! Strategy resolution: namespaced strategies shadow cluster strategies

use crate::crds::{BuildStrategyKind, BuildStrategySpec, StrategyRef};
use crate::store::{ClusterReader, StoreError};
use crate::validate::BuildReason;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyScope {
    Namespace,
    Cluster,
}

impl fmt::Display for StrategyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => f.write_str("Namespace"),
            Self::Cluster => f.write_str("Cluster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStrategy {
    pub name: String,
    pub scope: StrategyScope,
    pub spec: BuildStrategySpec,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{}", not_found_message(.name, .namespace, .searched))]
    NotFound {
        name: String,
        namespace: String,
        searched: Vec<StrategyScope>,
    },

    #[error(transparent)]
    Lookup(#[from] StoreError),
}

fn not_found_message(name: &str, namespace: &str, searched: &[StrategyScope]) -> String {
    match searched {
        [StrategyScope::Namespace] => {
            format!("BuildStrategy {name} not found in namespace {namespace}")
        }
        [StrategyScope::Cluster] => format!("ClusterBuildStrategy {name} not found"),
        _ => format!(
            "strategy {name} not found in namespace {namespace} nor as a ClusterBuildStrategy"
        ),
    }
}

impl ResolveError {
    /// Build-level reason for a strategy that could not be found
    #[must_use]
    pub fn reason(&self) -> Option<BuildReason> {
        match self {
            Self::NotFound { searched, .. } => Some(match searched.as_slice() {
                [StrategyScope::Cluster] => BuildReason::ClusterBuildStrategyNotFound,
                _ => BuildReason::BuildStrategyNotFound,
            }),
            Self::Lookup(_) => None,
        }
    }
}

async fn lookup(
    reader: &dyn ClusterReader,
    namespace: &str,
    name: &str,
    scope: StrategyScope,
) -> Result<Option<ResolvedStrategy>, StoreError> {
    let spec = match scope {
        StrategyScope::Namespace => reader
            .get_build_strategy(namespace, name)
            .await?
            .map(|strategy| strategy.spec),
        StrategyScope::Cluster => reader
            .get_cluster_build_strategy(name)
            .await?
            .map(|strategy| BuildStrategySpec::from(strategy.spec)),
    };
    Ok(spec.map(|spec| ResolvedStrategy {
        name: name.to_string(),
        scope,
        spec,
    }))
}

async fn resolve_in(
    reader: &dyn ClusterReader,
    namespace: &str,
    name: &str,
    scopes: &[StrategyScope],
) -> Result<ResolvedStrategy, ResolveError> {
    for scope in scopes {
        if let Some(resolved) = lookup(reader, namespace, name, *scope).await? {
            debug!(strategy = %name, scope = %scope, "Resolved build strategy");
            return Ok(resolved);
        }
    }
    Err(ResolveError::NotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
        searched: scopes.to_vec(),
    })
}

/// Resolve `name`, trying the namespace first and the cluster second
pub async fn resolve(
    reader: &dyn ClusterReader,
    namespace: &str,
    name: &str,
) -> Result<ResolvedStrategy, ResolveError> {
    resolve_in(
        reader,
        namespace,
        name,
        &[StrategyScope::Namespace, StrategyScope::Cluster],
    )
    .await
}

/// Resolve a Build's strategy reference; an explicit kind restricts the search to that scope
pub async fn resolve_ref(
    reader: &dyn ClusterReader,
    namespace: &str,
    strategy: &StrategyRef,
) -> Result<ResolvedStrategy, ResolveError> {
    match strategy.kind {
        None => resolve(reader, namespace, &strategy.name).await,
        Some(BuildStrategyKind::BuildStrategy) => {
            resolve_in(reader, namespace, &strategy.name, &[StrategyScope::Namespace]).await
        }
        Some(BuildStrategyKind::ClusterBuildStrategy) => {
            resolve_in(reader, namespace, &strategy.name, &[StrategyScope::Cluster]).await
        }
    }
}
