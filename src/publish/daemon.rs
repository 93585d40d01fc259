//! Container daemon transport
//!
//! Only the image push endpoint of the Docker Engine API is used. The daemon
//! answers with a stream of JSON progress records that is handed back
//! unparsed as a [`ProgressStream`].

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{PipelineError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Raw push progress bytes as produced by the daemon
pub type ProgressStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// Start pushing `image:tag`; `registry_auth` is the opaque
    /// `X-Registry-Auth` token
    async fn push_image(&self, image: &str, tag: &str, registry_auth: &str) -> Result<ProgressStream>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DaemonEndpoint {
    Unix(PathBuf),
    Http(String),
}

impl DaemonEndpoint {
    fn parse(host: &str) -> Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(PipelineError::Config(format!("DOCKER_HOST {} has no socket path", host)));
            }
            return Ok(DaemonEndpoint::Unix(PathBuf::from(path)));
        }
        if let Some(address) = host.strip_prefix("tcp://") {
            return Ok(DaemonEndpoint::Http(format!("http://{}", address.trim_end_matches('/'))));
        }
        if host.starts_with("http://") || host.starts_with("https://") {
            return Ok(DaemonEndpoint::Http(host.trim_end_matches('/').to_string()));
        }
        Err(PipelineError::Config(format!("unsupported DOCKER_HOST {}", host)))
    }
}

/// Docker Engine API client
#[derive(Debug, Clone)]
pub struct EngineClient {
    endpoint: DaemonEndpoint,
    http: reqwest::Client,
    output: Logger,
}

impl EngineClient {
    /// `docker_host` follows the `DOCKER_HOST` syntax; `None` uses the local socket
    pub fn new(docker_host: Option<&str>, output: Logger) -> Result<Self> {
        let endpoint = DaemonEndpoint::parse(docker_host.unwrap_or(DEFAULT_DOCKER_HOST))?;
        // Pushes of large builder images routinely outlast any fixed timeout
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot create HTTP client: {}", e)))?;
        Ok(Self { endpoint, http, output })
    }

    fn push_path(image: &str, tag: &str) -> String {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("tag", tag)
            .finish();
        format!("/images/{}/push?{}", image, query)
    }

    async fn push_over_unix(
        &self,
        socket: &PathBuf,
        image: &str,
        path: &str,
        registry_auth: &str,
    ) -> Result<ProgressStream> {
        let stream = tokio::net::UnixStream::connect(socket).await.map_err(|e| {
            PipelineError::transport(
                "connect to daemon",
                socket.display().to_string(),
                None,
                e.to_string(),
            )
        })?;
        let (mut sender, connection) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| PipelineError::transport("daemon handshake", image, None, e.to_string()))?;
        let output = self.output.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                output.debug(&format!("daemon connection closed: {}", e));
            }
        });

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(path)
            .header(hyper::header::HOST, "docker")
            .header(REGISTRY_AUTH_HEADER, registry_auth)
            .body(hyper::Body::empty())
            .map_err(|e| PipelineError::transport("push", image, None, e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| PipelineError::transport("push", image, None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap_or_default();
            let status = reqwest::StatusCode::from_u16(status.as_u16())
                .unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
            return Err(HttpErrorHandler::handle_daemon_error(
                status,
                String::from_utf8_lossy(&body).trim(),
                image,
            ));
        }

        Ok(Box::pin(response.into_body().map_err(io::Error::other)))
    }

    async fn push_over_http(
        &self,
        base: &str,
        image: &str,
        path: &str,
        registry_auth: &str,
    ) -> Result<ProgressStream> {
        let response = self
            .http
            .post(format!("{}{}", base, path))
            .header(REGISTRY_AUTH_HEADER, registry_auth)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "push", image))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_daemon_error(status, text.trim(), image));
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other))))
    }
}

#[async_trait]
impl DaemonClient for EngineClient {
    async fn push_image(&self, image: &str, tag: &str, registry_auth: &str) -> Result<ProgressStream> {
        let path = Self::push_path(image, tag);
        self.output.verbose(&format!("Asking the daemon to push {}:{}", image, tag));
        match &self.endpoint {
            DaemonEndpoint::Unix(socket) => self.push_over_unix(socket, image, &path, registry_auth).await,
            DaemonEndpoint::Http(base) => self.push_over_http(base, image, &path, registry_auth).await,
        }
    }
}
