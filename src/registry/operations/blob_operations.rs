//! Blob operations for registry client
//!
//! Implements Docker Registry v2 blob operations:
//! - Blob existence checks (HEAD /v2/{name}/blobs/{digest})
//! - Blob download (GET /v2/{name}/blobs/{digest})
//! - Cross-repository mount (POST /v2/{name}/blobs/uploads/?mount=..&from=..)
//! - Monolithic upload (POST /v2/{name}/blobs/uploads/ then PUT ?digest=)

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{PipelineError, Result};
use crate::image::DigestUtils;
use crate::logging::Logger;
use crate::registry::auth::Authorization;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, Response, StatusCode};
use url::Url;

#[derive(Clone)]
pub struct BlobOperations {
    client: Client,
    address: String,
    output: Logger,
}

impl BlobOperations {
    pub fn new(client: Client, address: String, output: Logger) -> Self {
        Self { client, address, output }
    }

    fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.address, repository, digest)
    }

    /// Check if blob exists using a HEAD request
    pub async fn blob_exists(&self, repository: &str, digest: &str, auth: &Authorization) -> Result<bool> {
        let display = format!("{}@{}", repository, digest);
        let response = auth
            .apply(self.client.head(self.blob_url(repository, digest)))
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "HEAD blob", &display))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(HttpErrorHandler::handle_registry_error(status, "", "HEAD blob", &display)),
        }
    }

    /// Download a blob into memory and verify its digest
    pub async fn get_blob(&self, repository: &str, digest: &str, auth: &Authorization) -> Result<Vec<u8>> {
        let response = self.open_blob(repository, digest, auth).await?;
        let display = format!("{}@{}", repository, digest);
        let data = response
            .bytes()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "GET blob", &display))?;
        DigestUtils::verify(&data, digest, &format!("blob {}", display))?;
        Ok(data.to_vec())
    }

    /// Start a blob download, leaving the body unread
    pub async fn open_blob(&self, repository: &str, digest: &str, auth: &Authorization) -> Result<Response> {
        let display = format!("{}@{}", repository, digest);
        let response = auth
            .apply(self.client.get(self.blob_url(repository, digest)))
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "GET blob", &display))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "GET blob", &display));
        }
        Ok(response)
    }

    /// Ask the registry to mount a blob from another repository it hosts.
    /// Returns false when the registry opened a regular upload instead.
    pub async fn mount_blob(
        &self,
        repository: &str,
        digest: &str,
        from: &str,
        auth: &Authorization,
    ) -> Result<bool> {
        let display = format!("{}@{}", repository, digest);
        let url = format!("{}/v2/{}/blobs/uploads/", self.address, repository);
        let response = auth
            .apply(self.client.post(&url).query(&[("mount", digest), ("from", from)]))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "mount blob", &display))?;

        match response.status() {
            StatusCode::CREATED => {
                self.output.detail(&format!("Mounted {} from {}", digest, from));
                Ok(true)
            }
            StatusCode::ACCEPTED => Ok(false),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(HttpErrorHandler::handle_registry_error(status, &text, "mount blob", &display))
            }
        }
    }

    /// Monolithic upload: open an upload session, then PUT the whole body
    pub async fn upload_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        body: impl Into<Body>,
        auth: &Authorization,
    ) -> Result<()> {
        let display = format!("{}@{}", repository, digest);
        let location = self.start_upload(repository, &display, auth).await?;

        let mut url = location;
        url.query_pairs_mut().append_pair("digest", digest);
        self.output
            .detail(&format!("Uploading blob {} ({})", digest, self.output.format_size(size)));

        let response = auth
            .apply(self.client.put(url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "PUT blob", &display))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "PUT blob", &display));
        }
        Ok(())
    }

    async fn start_upload(&self, repository: &str, display: &str, auth: &Authorization) -> Result<Url> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.address, repository);
        let response = auth
            .apply(self.client.post(&url))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "start upload", display))?;

        let status = response.status();
        if status != StatusCode::ACCEPTED && !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "start upload", display));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PipelineError::transport("start upload", display, Some(status.as_u16()), "missing Location header")
            })?;
        resolve_location(&self.address, location)
    }
}

/// Upload locations may be absolute or relative to the registry
fn resolve_location(address: &str, location: &str) -> Result<Url> {
    let base = Url::parse(&format!("{}/", address))?;
    Ok(base.join(location)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_locations_resolve_against_registry() {
        let url = resolve_location("http://localhost:5000", "/v2/a/b/blobs/uploads/123?_state=xyz").unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/v2/a/b/blobs/uploads/123?_state=xyz");
    }

    #[test]
    fn absolute_locations_are_kept() {
        let url = resolve_location("https://ghcr.io", "https://uploads.example.com/session/1").unwrap();
        assert_eq!(url.host_str(), Some("uploads.example.com"));
    }

    use crate::registry::test_server::{Reply, TestServer};

    const LAYER: &[u8] = b"layer contents";

    fn operations(server: &TestServer) -> BlobOperations {
        BlobOperations::new(Client::new(), server.url(""), Logger::new_quiet())
    }

    fn layer_digest() -> String {
        DigestUtils::compute_docker_digest(LAYER)
    }

    #[tokio::test]
    async fn existence_follows_status() {
        let server = TestServer::start(|request| match request.path() {
            "/v2/knative/present/blobs/sha256:aa" => Reply::new(200),
            "/v2/knative/absent/blobs/sha256:aa" => Reply::new(404),
            _ => Reply::new(500),
        })
        .await;
        let blobs = operations(&server);
        let auth = Authorization::Anonymous;

        assert!(blobs.blob_exists("knative/present", "sha256:aa", &auth).await.unwrap());
        assert!(!blobs.blob_exists("knative/absent", "sha256:aa", &auth).await.unwrap());
        let err = blobs.blob_exists("knative/broken", "sha256:aa", &auth).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn downloads_are_verified() {
        let server = TestServer::start(|request| {
            if request.path().ends_with(&layer_digest()) {
                Reply::new(200).body(LAYER)
            } else {
                Reply::new(200).body("tampered")
            }
        })
        .await;
        let blobs = operations(&server);

        let data = blobs
            .get_blob("knative/base", &layer_digest(), &Authorization::Anonymous)
            .await
            .unwrap();
        assert_eq!(data, LAYER);

        let other = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
        let err = blobs
            .get_blob("knative/base", other, &Authorization::Anonymous)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidManifest(_)), "{err}");
    }

    #[tokio::test]
    async fn mount_reports_created() {
        let server = TestServer::start(|_| Reply::new(201)).await;
        let mounted = operations(&server)
            .mount_blob("knative/target", &layer_digest(), "knative/source", &Authorization::Anonymous)
            .await
            .unwrap();
        assert!(mounted);

        let request = &server.requests()[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.path(), "/v2/knative/target/blobs/uploads/");
        assert!(request.query().contains("from=knative%2Fsource"), "{}", request.query());
    }

    #[tokio::test]
    async fn refused_mount_falls_back_to_upload() {
        let server = TestServer::start(|request| match request.method.as_str() {
            "POST" => Reply::new(202).header("Location", "/v2/knative/target/blobs/uploads/abc?_state=s1"),
            "PUT" => Reply::new(201),
            _ => Reply::new(500),
        })
        .await;
        let blobs = operations(&server);
        let auth = Authorization::Basic {
            username: "robot".to_string(),
            password: "secret".to_string(),
        };

        let mounted = blobs
            .mount_blob("knative/target", &layer_digest(), "knative/source", &auth)
            .await
            .unwrap();
        assert!(!mounted);
        blobs
            .upload_blob("knative/target", &layer_digest(), LAYER.len() as u64, LAYER.to_vec(), &auth)
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 3);
        let put = &requests[2];
        assert_eq!(put.method, "PUT");
        assert_eq!(put.path(), "/v2/knative/target/blobs/uploads/abc");
        assert!(put.query().starts_with("_state=s1&digest=sha256%3A"), "{}", put.query());
        assert_eq!(put.header("content-type"), Some("application/octet-stream"));
        assert_eq!(put.body, LAYER);
    }

    #[tokio::test]
    async fn upload_without_location_fails() {
        let server = TestServer::start(|_| Reply::new(202)).await;
        let err = operations(&server)
            .upload_blob("knative/target", &layer_digest(), 1, vec![0u8], &Authorization::Anonymous)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing Location header"), "{err}");
    }
}
