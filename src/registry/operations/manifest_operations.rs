//! Manifest operations for registry client
//!
//! Implements the Docker Registry v2 / OCI manifest endpoints:
//! - existence and descriptor lookup (HEAD /v2/{name}/manifests/{reference})
//! - manifest download (GET /v2/{name}/manifests/{reference})
//! - manifest upload (PUT /v2/{name}/manifests/{reference})

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{PipelineError, Result};
use crate::image::manifest::{Descriptor, MANIFEST_ACCEPT};
use crate::image::DigestUtils;
use crate::logging::Logger;
use crate::registry::auth::Authorization;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Raw manifest as served by the registry
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub media_type: String,
    pub data: Vec<u8>,
    pub digest: String,
}

impl FetchedManifest {
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            size: self.data.len() as u64,
            digest: self.digest.clone(),
            platform: None,
            annotations: None,
        }
    }
}

#[derive(Clone)]
pub struct ManifestOperations {
    client: Client,
    address: String,
    output: Logger,
}

impl ManifestOperations {
    pub fn new(client: Client, address: String, output: Logger) -> Self {
        Self { client, address, output }
    }

    fn url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.address, repository, reference)
    }

    /// Descriptor of a manifest without downloading it. Falls back to a GET
    /// when the registry omits the digest header.
    pub async fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
        auth: &Authorization,
    ) -> Result<Descriptor> {
        let display = format!("{}:{}", repository, reference);
        let request = self.client.head(self.url(repository, reference)).header(ACCEPT, MANIFEST_ACCEPT);
        let response = auth
            .apply(request)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "HEAD manifest", &display))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpErrorHandler::handle_registry_error(status, "", "HEAD manifest", &display));
        }

        let digest = header_value(&response, DOCKER_CONTENT_DIGEST);
        let media_type = header_value(&response, CONTENT_TYPE.as_str());
        let size = header_value(&response, CONTENT_LENGTH.as_str()).and_then(|v| v.parse::<u64>().ok());

        match (digest, media_type, size) {
            (Some(digest), Some(media_type), Some(size)) if DigestUtils::is_valid_docker_digest(&digest) => {
                Ok(Descriptor {
                    media_type: strip_parameters(&media_type),
                    size,
                    digest,
                    platform: None,
                    annotations: None,
                })
            }
            _ => {
                self.output
                    .detail(&format!("HEAD {} lacks descriptor headers, falling back to GET", display));
                Ok(self.get_manifest(repository, reference, auth).await?.descriptor())
            }
        }
    }

    /// Download a manifest. The digest is computed locally and, when the
    /// reference is a digest, verified against it.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
        auth: &Authorization,
    ) -> Result<FetchedManifest> {
        let display = format!("{}:{}", repository, reference);
        self.output.detail(&format!("Fetching manifest {}", display));

        let request = self.client.get(self.url(repository, reference)).header(ACCEPT, MANIFEST_ACCEPT);
        let response = auth
            .apply(request)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "GET manifest", &display))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "GET manifest", &display));
        }

        let media_type = header_value(&response, CONTENT_TYPE.as_str()).map(|m| strip_parameters(&m));
        let data = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "GET manifest", &display))?
            .to_vec();

        if DigestUtils::is_valid_docker_digest(reference) {
            DigestUtils::verify(&data, reference, &format!("manifest {}", display))?;
        }

        let media_type = match media_type {
            Some(media_type) if !media_type.is_empty() => media_type,
            _ => embedded_media_type(&data).ok_or_else(|| {
                PipelineError::InvalidManifest(format!("manifest {} has no media type", display))
            })?,
        };

        Ok(FetchedManifest {
            media_type,
            digest: DigestUtils::compute_docker_digest(&data),
            data,
        })
    }

    /// Upload a manifest, returning the digest the registry stored it under
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: &[u8],
        auth: &Authorization,
    ) -> Result<String> {
        let display = format!("{}:{}", repository, reference);
        self.output
            .verbose(&format!("Uploading manifest {} with content-type {}", display, media_type));

        let request = self
            .client
            .put(self.url(repository, reference))
            .header(CONTENT_TYPE, media_type)
            .body(data.to_vec());
        let response = auth
            .apply(request)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "PUT manifest", &display))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "PUT manifest", &display));
        }

        let local = DigestUtils::compute_docker_digest(data);
        if let Some(remote) = header_value(&response, DOCKER_CONTENT_DIGEST) {
            if remote != local {
                return Err(PipelineError::InvalidManifest(format!(
                    "registry stored {} as {}, expected {}",
                    display, remote, local
                )));
            }
        }
        Ok(local)
    }
}

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strip_parameters(media_type: &str) -> String {
    media_type.split(';').next().unwrap_or_default().trim().to_string()
}

fn embedded_media_type(data: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    value.get("mediaType")?.as_str().map(str::to_string)
}
