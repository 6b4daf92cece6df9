use super::{BuildPath, BuildReason, ValidationError};
use crate::crds::Build;
use crate::tasks::buildrun::resources::SOURCE_STEP_NAME;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

/// Prefix of the step that downloads an additional source
const SOURCE_STEP_PREFIX: &str = "source-";

/// Container names are DNS-1123 labels of at most 63 characters
const MAX_SOURCE_NAME_LENGTH: usize = 63 - SOURCE_STEP_PREFIX.len();

static SOURCE_NAME_REGEX: OnceLock<Regex> = OnceLock::new();

fn source_name_regex() -> &'static Regex {
    SOURCE_NAME_REGEX
        .get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("Invalid regex pattern"))
}

/// Additional sources need a unique DNS-1123 label name and an HTTP(S) URL.
/// The name becomes part of a step name, so it may not collide with the primary source step.
pub struct SourcesRef<'a> {
    pub build: &'a Build,
}

#[async_trait]
impl BuildPath for SourcesRef<'_> {
    async fn validate_path(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for (index, source) in self.build.spec.sources.iter().enumerate() {
            let name = source.name.trim();
            if name.is_empty() {
                return Err(ValidationError::invalid(
                    BuildReason::SourceNameEmpty,
                    format!("spec.sources[{index}].name must not be empty"),
                ));
            }
            let step_name = format!("{SOURCE_STEP_PREFIX}{}", source.name);
            if !source_name_regex().is_match(&source.name)
                || source.name.len() > MAX_SOURCE_NAME_LENGTH
            {
                return Err(ValidationError::invalid(
                    BuildReason::SourceNameInvalid,
                    format!(
                        "source name {:?} must be a lowercase DNS-1123 label of at most {MAX_SOURCE_NAME_LENGTH} characters",
                        source.name
                    ),
                ));
            }
            if step_name == SOURCE_STEP_NAME {
                return Err(ValidationError::invalid(
                    BuildReason::SourceNameInvalid,
                    format!("source name {name} is reserved for the primary source"),
                ));
            }
            if !seen.insert(name) {
                return Err(ValidationError::invalid(
                    BuildReason::SourceNameNotUnique,
                    format!("source name {name} is used more than once in spec.sources"),
                ));
            }

            let valid = Url::parse(&source.url)
                .is_ok_and(|url| matches!(url.scheme(), "http" | "https") && url.has_host());
            if !valid {
                return Err(ValidationError::invalid(
                    BuildReason::SourceUrlNotValid,
                    format!("source {name} has an invalid URL: {}", source.url),
                ));
            }
        }
        Ok(())
    }
}
