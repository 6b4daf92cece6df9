use super::{BuildPath, BuildReason, ValidationError};
use crate::crds::Build;
use crate::image_ref::ImageReference;
use async_trait::async_trait;

/// Image references of the Build: runtime base (when set) and output
pub struct RuntimeRef<'a> {
    pub build: &'a Build,
}

#[async_trait]
impl BuildPath for RuntimeRef<'_> {
    async fn validate_path(&self) -> Result<(), ValidationError> {
        if let Some(runtime) = &self.build.spec.runtime {
            if runtime.paths.is_empty() {
                return Err(ValidationError::invalid(
                    BuildReason::RuntimePathsCanNotBeEmpty,
                    "spec.runtime.paths must list at least one path",
                ));
            }
            if let Some(base) = &runtime.base {
                ImageReference::parse(&base.image).map_err(|e| {
                    ValidationError::invalid(BuildReason::RuntimeImageInvalid, e.to_string())
                })?;
            }
        }

        ImageReference::parse(&self.build.spec.output.image)
            .map(|_| ())
            .map_err(|e| ValidationError::invalid(BuildReason::OutputImageInvalid, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{Image, Runtime};
    use crate::validate::test_support::build;

    fn reason_of(result: Result<(), ValidationError>) -> Option<BuildReason> {
        match result {
            Err(ValidationError::Invalid { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    #[tokio::test]
    async fn runtime_requires_paths_and_valid_base() {
        let mut build = build("app");
        build.spec.runtime = Some(Runtime {
            base: Some(Image {
                image: "Registry.Example.com/BAD NAME".to_string(),
                push_secret: None,
            }),
            paths: vec![],
            ..Runtime::default()
        });
        assert_eq!(
            reason_of(RuntimeRef { build: &build }.validate_path().await),
            Some(BuildReason::RuntimePathsCanNotBeEmpty)
        );

        build.spec.runtime.as_mut().unwrap().paths = vec!["/workspace/app".to_string()];
        assert_eq!(
            reason_of(RuntimeRef { build: &build }.validate_path().await),
            Some(BuildReason::RuntimeImageInvalid)
        );

        build.spec.runtime.as_mut().unwrap().base.as_mut().unwrap().image =
            "gcr.io/distroless/static:nonroot".to_string();
        assert!(RuntimeRef { build: &build }.validate_path().await.is_ok());
    }

    #[tokio::test]
    async fn output_image_must_parse() {
        let mut build = build("app");
        build.spec.output.image = "registry.example.com/team/app:".to_string();
        assert_eq!(
            reason_of(RuntimeRef { build: &build }.validate_path().await),
            Some(BuildReason::OutputImageInvalid)
        );
    }
}
