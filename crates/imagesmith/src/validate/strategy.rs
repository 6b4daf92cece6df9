use super::{BuildPath, BuildReason, ValidationError};
use crate::crds::Build;
use crate::resolver::{self, ResolveError};
use crate::store::ClusterReader;
use async_trait::async_trait;
use kube::ResourceExt;

/// The referenced strategy must exist in the scope the Build asks for
pub struct Strategy<'a> {
    pub build: &'a Build,
    pub reader: &'a dyn ClusterReader,
}

#[async_trait]
impl BuildPath for Strategy<'_> {
    async fn validate_path(&self) -> Result<(), ValidationError> {
        let namespace = self.build.namespace().unwrap_or_default();
        match resolver::resolve_ref(self.reader, &namespace, &self.build.spec.strategy).await {
            Ok(_) => Ok(()),
            Err(ResolveError::Lookup(err)) => Err(ValidationError::Lookup(err)),
            Err(err) => {
                let reason = err.reason().unwrap_or(BuildReason::BuildStrategyNotFound);
                Err(ValidationError::invalid(reason, err.to_string()))
            }
        }
    }
}
