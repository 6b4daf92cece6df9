use super::{BuildPath, BuildReason, ValidationError};
use crate::crds::Build;
use crate::store::ClusterReader;
use async_trait::async_trait;
use kube::ResourceExt;

/// Every secret the Build references must exist in its namespace
pub struct Credentials<'a> {
    pub build: &'a Build,
    pub reader: &'a dyn ClusterReader,
}

impl Credentials<'_> {
    /// Secret references in check order: `(secret, field path, reason)`
    fn references(&self) -> Vec<(String, String, BuildReason)> {
        let spec = &self.build.spec;
        let mut refs = Vec::new();

        if let Some(secret) = &spec.source.git.clone_secret {
            refs.push((
                secret.clone(),
                "spec.source.git.cloneSecret".to_string(),
                BuildReason::SpecSourceSecretRefNotFound,
            ));
        }
        if let Some(secret) = &spec.output.push_secret {
            refs.push((
                secret.clone(),
                "spec.output.pushSecret".to_string(),
                BuildReason::SpecOutputSecretRefNotFound,
            ));
        }
        if let Some(secret) = spec.builder.as_ref().and_then(|b| b.push_secret.as_ref()) {
            refs.push((
                secret.clone(),
                "spec.builder.pushSecret".to_string(),
                BuildReason::SpecBuilderSecretRefNotFound,
            ));
        }
        for (index, volume) in spec.volumes.iter().enumerate() {
            if let Some(secret) = &volume.secret {
                refs.push((
                    secret.clone(),
                    format!("spec.volumes[{index}].secret"),
                    BuildReason::VolumeSecretRefNotFound,
                ));
            }
        }
        refs
    }
}

#[async_trait]
impl BuildPath for Credentials<'_> {
    async fn validate_path(&self) -> Result<(), ValidationError> {
        let namespace = self.build.namespace().unwrap_or_default();
        for (secret, field, reason) in self.references() {
            if !self.reader.secret_exists(&namespace, &secret).await? {
                return Err(ValidationError::invalid(
                    reason,
                    format!("referenced secret {secret} not found ({field})"),
                ));
            }
        }
        Ok(())
    }
}
