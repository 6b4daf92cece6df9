//! Container registry lookups used to enrich the results of successful runs
//!
//! Speaks the OCI distribution API anonymously: a `401` with a Bearer
//! challenge is answered with a token fetched from the advertised realm.

use crate::crds::ImagePlatform;
use crate::image_ref::ImageReference;
use crate::tasks::config::RegistryConfig;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

static CHALLENGE_PARAM_REGEX: OnceLock<Regex> = OnceLock::new();

fn challenge_param_regex() -> &'static Regex {
    CHALLENGE_PARAM_REGEX
        .get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("Invalid regex pattern"))
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("registry challenge could not be answered: {0}")]
    Unauthorized(String),

    #[error("registry did not report a digest for {0}")]
    MissingDigest(String),

    #[error("unexpected manifest for {image}: {reason}")]
    InvalidManifest { image: String, reason: String },
}

/// Digest, size and platforms of a published image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDetails {
    pub digest: String,
    pub size: Option<i64>,
    pub platforms: Vec<ImagePlatform>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn resolve_digest_and_platforms(
        &self,
        image: &ImageReference,
    ) -> Result<ImageDetails, RegistryError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    manifests: Option<Vec<IndexEntry>>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct IndexEntry {
    #[serde(default)]
    size: i64,
    #[serde(default)]
    platform: Option<PlatformEntry>,
}

#[derive(Deserialize)]
struct PlatformEntry {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Deserialize)]
struct Descriptor {
    #[serde(default)]
    size: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

fn details_from_manifest(
    image: &ImageReference,
    digest: String,
    manifest: Manifest,
) -> Result<ImageDetails, RegistryError> {
    if let Some(entries) = manifest.manifests {
        let size = entries.iter().map(|entry| entry.size).sum();
        // Attestation manifests are published with an `unknown` platform
        let platforms = entries
            .into_iter()
            .filter_map(|entry| entry.platform)
            .filter(|platform| platform.os != "unknown")
            .map(|platform| ImagePlatform {
                os: platform.os,
                architecture: platform.architecture,
                variant: platform.variant,
            })
            .collect();
        return Ok(ImageDetails {
            digest,
            size: Some(size),
            platforms,
        });
    }

    let config = manifest
        .config
        .ok_or_else(|| RegistryError::InvalidManifest {
            image: image.to_string(),
            reason: "neither an index nor an image manifest".to_string(),
        })?;
    let size = config.size + manifest.layers.iter().map(|layer| layer.size).sum::<i64>();
    Ok(ImageDetails {
        digest,
        size: Some(size),
        platforms: Vec::new(),
    })
}

pub struct HttpRegistryClient {
    http: reqwest::Client,
    insecure_registries: Vec<String>,
}

impl HttpRegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            insecure_registries: config.insecure_registries.clone(),
        })
    }

    fn manifest_url(&self, image: &ImageReference) -> String {
        let scheme = if self.insecure_registries.iter().any(|r| r == &image.registry) {
            "http"
        } else {
            "https"
        };
        format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            image.api_host(),
            image.repository,
            image.manifest_reference()
        )
    }

    async fn fetch_token(&self, challenge: &str) -> Result<String, RegistryError> {
        let params: Vec<(String, String)> = challenge_param_regex()
            .captures_iter(challenge)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()))
            .collect();
        let realm = params
            .iter()
            .find(|(key, _)| key == "realm")
            .map(|(_, value)| value.clone())
            .ok_or_else(|| RegistryError::Unauthorized(challenge.to_string()))?;
        let query: Vec<&(String, String)> =
            params.iter().filter(|(key, _)| key != "realm").collect();

        let response = self.http.get(&realm).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url: realm,
            });
        }
        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::Unauthorized("token response without a token".to_string()))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve_digest_and_platforms(
        &self,
        image: &ImageReference,
    ) -> Result<ImageDetails, RegistryError> {
        let url = self.manifest_url(image);
        let mut response = self
            .http
            .get(&url)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .filter(|value| value.starts_with("Bearer"))
                .map(str::to_string)
                .ok_or_else(|| RegistryError::Unauthorized(url.clone()))?;
            let token = self.fetch_token(&challenge).await?;
            debug!(image = %image, "Retrying manifest request with bearer token");
            response = self
                .http
                .get(&url)
                .header(ACCEPT, MANIFEST_MEDIA_TYPES)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await?;
        }

        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| image.digest.clone())
            .ok_or_else(|| RegistryError::MissingDigest(image.to_string()))?;

        let manifest: Manifest = response.json().await?;
        details_from_manifest(image, digest, manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> (HttpRegistryClient, String) {
        let host = server.address().to_string();
        let client = HttpRegistryClient::new(&RegistryConfig {
            insecure_registries: vec![host.clone()],
            timeout_seconds: 5,
        })
        .unwrap();
        (client, host)
    }

    #[tokio::test]
    async fn index_yields_platforms_and_digest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/v1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(DIGEST_HEADER, "sha256:index")
                    .set_body_json(json!({
                        "mediaType": "application/vnd.oci.image.index.v1+json",
                        "manifests": [
                            { "size": 100, "platform": { "os": "linux", "architecture": "amd64" } },
                            { "size": 120, "platform": { "os": "linux", "architecture": "arm64", "variant": "v8" } },
                            { "size": 10, "platform": { "os": "unknown", "architecture": "unknown" } }
                        ]
                    })),
            )
            .mount(&server)
            .await;

        let (client, host) = client_for(&server);
        let image = ImageReference::parse(&format!("{host}/team/app:v1")).unwrap();
        let details = client.resolve_digest_and_platforms(&image).await.unwrap();

        assert_eq!(details.digest, "sha256:index");
        assert_eq!(details.size, Some(230));
        assert_eq!(details.platforms.len(), 2);
        assert_eq!(details.platforms[1].variant.as_deref(), Some("v8"));
    }

    #[tokio::test]
    async fn bearer_challenge_is_answered() {
        let server = MockServer::start().await;
        let realm = format!("{}/token", server.uri());

        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/latest"))
            .and(header("authorization", "Bearer t0k3n"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(DIGEST_HEADER, "sha256:single")
                    .set_body_json(json!({
                        "config": { "size": 10 },
                        "layers": [{ "size": 100 }, { "size": 200 }]
                    })),
            )
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/latest"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(r#"Bearer realm="{realm}",service="registry",scope="repository:team/app:pull""#)
                    .as_str(),
            ))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("scope", "repository:team/app:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "t0k3n" })))
            .mount(&server)
            .await;

        let (client, host) = client_for(&server);
        let image = ImageReference::parse(&format!("{host}/team/app")).unwrap();
        let details = client.resolve_digest_and_platforms(&image).await.unwrap();

        assert_eq!(details.digest, "sha256:single");
        assert_eq!(details.size, Some(310));
        assert!(details.platforms.is_empty());
    }

    #[tokio::test]
    async fn missing_manifest_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (client, host) = client_for(&server);
        let image = ImageReference::parse(&format!("{host}/team/app:v1")).unwrap();
        let err = client.resolve_digest_and_platforms(&image).await.unwrap_err();
        assert!(matches!(err, RegistryError::Status { status: 404, .. }));
    }
}
