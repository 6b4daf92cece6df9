use super::{BuildPath, BuildReason, ValidationError};
use crate::crds::Build;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use url::Url;

const GIT_SCHEMES: &[&str] = &["https", "http", "ssh", "git"];

static SCP_LIKE_REGEX: OnceLock<Regex> = OnceLock::new();

fn scp_like_regex() -> &'static Regex {
    SCP_LIKE_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[A-Za-z0-9._~/-]+$")
            .expect("Invalid regex pattern")
    })
}

/// Structural check of a git URL; no network access
pub fn check_git_url(raw: &str) -> Result<(), String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("source URL is empty".to_string());
    }
    if scp_like_regex().is_match(raw) {
        return Ok(());
    }

    let url = Url::parse(raw).map_err(|e| format!("source URL {raw} is not valid: {e}"))?;
    if !GIT_SCHEMES.contains(&url.scheme()) {
        return Err(format!(
            "source URL {raw} uses unsupported scheme {}",
            url.scheme()
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("source URL {raw} has no host"));
    }
    Ok(())
}

/// The primary source URL must be well formed
pub struct SourceUrlRef<'a> {
    pub build: &'a Build,
}

#[async_trait]
impl BuildPath for SourceUrlRef<'_> {
    async fn validate_path(&self) -> Result<(), ValidationError> {
        check_git_url(&self.build.spec.source.git.url)
            .map_err(|message| ValidationError::invalid(BuildReason::SourceUrlInvalid, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::test_support::build;

    #[test]
    fn accepts_common_git_locations() {
        for url in [
            "https://github.com/example-org/sample-go",
            "ssh://git@gitlab.example.com:2222/team/app.git",
            "git@github.com:example-org/sample-go.git",
            "git://git.example.com/app",
        ] {
            assert!(check_git_url(url).is_ok(), "{url} should be accepted");
        }
    }

    #[test]
    fn rejects_empty_and_scheme_invalid_values() {
        assert_eq!(check_git_url("  ").unwrap_err(), "source URL is empty");
        assert!(check_git_url("ftp://example.com/app").unwrap_err().contains("ftp"));
        assert!(check_git_url("github.com/example-org/sample-go").is_err());
        assert!(check_git_url("https://").is_err());
    }

    #[tokio::test]
    async fn invalid_url_maps_to_reason() {
        let mut build = build("app");
        build.spec.source.git.url = "not a url".to_string();
        let err = SourceUrlRef { build: &build }.validate_path().await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Invalid { reason: BuildReason::SourceUrlInvalid, .. }
        ));
    }
}
