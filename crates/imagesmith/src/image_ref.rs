//! Container image reference parsing (`[registry[:port]/]path[:tag][@digest]`)

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Registry assumed for references without a domain component
pub const DEFAULT_REGISTRY: &str = "docker.io";

const MAX_NAME_LENGTH: usize = 255;

static PATH_COMPONENT_REGEX: OnceLock<Regex> = OnceLock::new();
static DOMAIN_REGEX: OnceLock<Regex> = OnceLock::new();
static TAG_REGEX: OnceLock<Regex> = OnceLock::new();
static DIGEST_REGEX: OnceLock<Regex> = OnceLock::new();

fn path_component_regex() -> &'static Regex {
    PATH_COMPONENT_REGEX.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("Invalid regex pattern")
    })
}

fn domain_regex() -> &'static Regex {
    DOMAIN_REGEX.get_or_init(|| {
        Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$")
            .expect("Invalid regex pattern")
    })
}

fn tag_regex() -> &'static Regex {
    TAG_REGEX.get_or_init(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("Invalid regex pattern"))
}

fn digest_regex() -> &'static Regex {
    DIGEST_REGEX.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$")
            .expect("Invalid regex pattern")
    })
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageReferenceError {
    #[error("image reference is empty")]
    Empty,

    #[error("image reference '{0}' has an invalid registry host")]
    InvalidRegistry(String),

    #[error("image reference '{0}' has an invalid repository path")]
    InvalidRepository(String),

    #[error("image reference '{0}' has an invalid tag")]
    InvalidTag(String),

    #[error("image reference '{0}' has an invalid digest")]
    InvalidDigest(String),

    #[error("image reference '{0}' exceeds {MAX_NAME_LENGTH} characters")]
    TooLong(String),
}

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, ImageReferenceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageReferenceError::Empty);
        }

        let (name_and_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest_regex().is_match(digest) {
                    return Err(ImageReferenceError::InvalidDigest(reference.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port
        let last_slash = name_and_tag.rfind('/').map_or(0, |index| index + 1);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(offset) => {
                let split = last_slash + offset;
                let tag = &name_and_tag[split + 1..];
                if !tag_regex().is_match(tag) {
                    return Err(ImageReferenceError::InvalidTag(reference.to_string()));
                }
                (&name_and_tag[..split], Some(tag.to_string()))
            }
            None => (name_and_tag, None),
        };

        if name.len() > MAX_NAME_LENGTH {
            return Err(ImageReferenceError::TooLong(reference.to_string()));
        }

        let (registry, path) = split_domain(name);
        if !domain_regex().is_match(&registry) {
            return Err(ImageReferenceError::InvalidRegistry(reference.to_string()));
        }
        if path.is_empty() || !path.split('/').all(|part| path_component_regex().is_match(part)) {
            return Err(ImageReferenceError::InvalidRepository(reference.to_string()));
        }

        Ok(Self {
            registry,
            repository: path,
            tag,
            digest,
        })
    }

    /// Tag or digest used to address the manifest, defaulting to `latest`
    #[must_use]
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    /// Registry host used for API calls (`docker.io` is served by `registry-1.docker.io`)
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }
}

fn split_domain(name: &str) -> (String, String) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ if !name.contains('/') => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
