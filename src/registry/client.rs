//! Registry client
//!
//! [`Registry`] is the seam the pipeline talks to; [`RegistryClient`] is its
//! reqwest implementation over the Docker Registry HTTP API v2. Every call
//! resolves credentials through the injected [`AuthResolver`] and negotiates
//! a repository-scoped authorization before touching the endpoint.

use crate::config::is_plain_http;
use crate::error::{PipelineError, Result};
use crate::image::manifest::{ConfigFile, Descriptor, ImageIndex, ImageManifest, ManifestType, DOCKER_MANIFEST_LIST};
use crate::image::reference::{ImageReference, DEFAULT_REGISTRY};
use crate::logging::Logger;
use crate::registry::auth::{Auth, Authorization};
use crate::registry::keychain::AuthResolver;
use crate::registry::operations::{BlobOperations, ManifestOperations};
use async_trait::async_trait;
use reqwest::{Body, Client};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const PULL: &str = "pull";
const PUSH: &str = "pull,push";

/// A single-architecture image read from a registry
#[derive(Debug, Clone)]
pub struct RemoteImage {
    /// Reference pinned to the manifest digest
    pub reference: ImageReference,
    pub descriptor: Descriptor,
    pub manifest: ImageManifest,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Descriptor of the manifest a reference points at
    async fn head(&self, reference: &ImageReference) -> Result<Descriptor>;

    /// Fetch a single-architecture image; indexes are rejected
    async fn get_image(&self, reference: &ImageReference) -> Result<RemoteImage>;

    async fn get_config(&self, image: &RemoteImage) -> Result<ConfigFile>;

    /// Make every child available in the target repository, then write the list
    async fn write_index(&self, target: &ImageReference, index: &ImageIndex) -> Result<Descriptor>;
}

pub struct RegistryClientBuilder {
    auth: AuthResolver,
    insecure_registries: Vec<String>,
    timeout: Duration,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(auth: AuthResolver, output: Logger) -> Self {
        Self {
            auth,
            insecure_registries: Vec::new(),
            timeout: Duration::from_secs(300),
            output,
        }
    }

    pub fn with_insecure_registries(mut self, registries: Vec<String>) -> Self {
        self.insecure_registries = registries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("update-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot create HTTP client: {}", e)))?;

        Ok(RegistryClient {
            auth_session: Auth::new(client.clone(), self.output.clone()),
            client,
            auth: self.auth,
            insecure_registries: self.insecure_registries,
            output: self.output,
            authorizations: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    auth: AuthResolver,
    auth_session: Auth,
    insecure_registries: Vec<String>,
    output: Logger,
    /// Negotiated authorizations keyed by registry, repository and actions
    authorizations: Arc<Mutex<HashMap<String, Authorization>>>,
}

impl RegistryClient {
    pub fn builder(auth: AuthResolver, output: Logger) -> RegistryClientBuilder {
        RegistryClientBuilder::new(auth, output)
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if is_plain_http(registry, &self.insecure_registries) {
            "http"
        } else {
            "https"
        };
        let host = if registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            registry
        };
        format!("{}://{}", scheme, host)
    }

    fn manifests(&self, registry: &str) -> ManifestOperations {
        ManifestOperations::new(self.client.clone(), self.base_url(registry), self.output.clone())
    }

    fn blobs(&self, registry: &str) -> BlobOperations {
        BlobOperations::new(self.client.clone(), self.base_url(registry), self.output.clone())
    }

    async fn authorize(&self, reference: &ImageReference, actions: &str) -> Result<Authorization> {
        let key = authorization_key(reference, actions);
        let cached = self.authorizations.lock().await.get(&key).cloned();
        if let Some(authorization) = cached {
            return Ok(authorization);
        }

        let credential = self.auth.resolve(reference).await?;
        let authorization = self
            .auth_session
            .authorize(
                &self.base_url(reference.registry()),
                reference.registry(),
                reference.repository(),
                actions,
                &credential,
            )
            .await?;
        self.authorizations.lock().await.insert(key, authorization.clone());
        Ok(authorization)
    }

    /// Forget a cached authorization once the registry stopped accepting it
    async fn invalidate(&self, reference: &ImageReference, actions: &str) {
        self.authorizations
            .lock()
            .await
            .remove(&authorization_key(reference, actions));
    }

    /// Run a registry call under the cached authorization. When the registry
    /// answers 401 the entry is evicted and the call is repeated once.
    async fn authorized<T, F, Fut>(&self, reference: &ImageReference, actions: &str, call: F) -> Result<T>
    where
        F: Fn(Authorization) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let authorization = self.authorize(reference, actions).await?;
        match call(authorization).await {
            Err(e) if e.is_unauthorized() => {
                self.output
                    .verbose(&format!("Authorization for {} was rejected, renewing it", reference.name()));
                self.invalidate(reference, actions).await;
                let authorization = self.authorize(reference, actions).await?;
                call(authorization).await
            }
            result => result,
        }
    }

    /// Copy one child image into the target repository unless it is already
    /// there. A 401 midway renews both authorizations and restarts the copy.
    async fn copy_image(&self, source: &ImageReference, target: &ImageReference, digest: &str) -> Result<()> {
        let target_auth = self.authorize(target, PUSH).await?;
        let source_auth = self.authorize(source, PULL).await?;
        match self
            .copy_with(source, target, digest, &source_auth, &target_auth)
            .await
        {
            Err(e) if e.is_unauthorized() => {
                self.output
                    .verbose(&format!("Authorization rejected while copying {}, renewing it", digest));
                self.invalidate(target, PUSH).await;
                self.invalidate(source, PULL).await;
                let target_auth = self.authorize(target, PUSH).await?;
                let source_auth = self.authorize(source, PULL).await?;
                self.copy_with(source, target, digest, &source_auth, &target_auth)
                    .await
            }
            result => result,
        }
    }

    async fn copy_with(
        &self,
        source: &ImageReference,
        target: &ImageReference,
        digest: &str,
        source_auth: &Authorization,
        target_auth: &Authorization,
    ) -> Result<()> {
        let target_manifests = self.manifests(target.registry());

        match target_manifests.head_manifest(target.repository(), digest, target_auth).await {
            Ok(_) => {
                self.output.detail(&format!("{} already present in {}", digest, target.name()));
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.output.verbose(&format!("Copying {}@{} into {}", source.name(), digest, target.name()));
        let fetched = self
            .manifests(source.registry())
            .get_manifest(source.repository(), digest, source_auth)
            .await?;
        let manifest = ImageManifest::from_slice(&fetched.data)?;

        let target_blobs = self.blobs(target.registry());
        let source_blobs = self.blobs(source.registry());
        for blob in manifest.blobs() {
            if target_blobs
                .blob_exists(target.repository(), &blob.digest, target_auth)
                .await?
            {
                continue;
            }
            if source.registry() == target.registry()
                && target_blobs
                    .mount_blob(target.repository(), &blob.digest, source.repository(), target_auth)
                    .await?
            {
                continue;
            }

            let response = source_blobs
                .open_blob(source.repository(), &blob.digest, source_auth)
                .await?;
            target_blobs
                .upload_blob(
                    target.repository(),
                    &blob.digest,
                    blob.size,
                    Body::wrap_stream(response.bytes_stream()),
                    target_auth,
                )
                .await?;
        }

        target_manifests
            .put_manifest(target.repository(), digest, &fetched.media_type, &fetched.data, target_auth)
            .await?;
        Ok(())
    }
}

fn authorization_key(reference: &ImageReference, actions: &str) -> String {
    format!("{}/{}:{}", reference.registry(), reference.repository(), actions)
}

#[async_trait]
impl Registry for RegistryClient {
    async fn head(&self, reference: &ImageReference) -> Result<Descriptor> {
        let manifests = &self.manifests(reference.registry());
        self.authorized(reference, PULL, move |auth| async move {
            manifests
                .head_manifest(reference.repository(), reference.api_reference(), &auth)
                .await
        })
        .await
    }

    async fn get_image(&self, reference: &ImageReference) -> Result<RemoteImage> {
        let manifests = &self.manifests(reference.registry());
        let fetched = self
            .authorized(reference, PULL, move |auth| async move {
                manifests
                    .get_manifest(reference.repository(), reference.api_reference(), &auth)
                    .await
            })
            .await?;

        match ManifestType::from_media_type(&fetched.media_type) {
            Some(kind) if kind.is_index() => {
                return Err(PipelineError::InvalidManifest(format!(
                    "{} is a manifest list, a single image is required",
                    reference
                )));
            }
            Some(_) => {}
            None => {
                return Err(PipelineError::InvalidManifest(format!(
                    "{} has unsupported media type {}",
                    reference, fetched.media_type
                )));
            }
        }

        let manifest = ImageManifest::from_slice(&fetched.data)?;
        Ok(RemoteImage {
            reference: reference.pinned(&fetched.digest)?,
            descriptor: fetched.descriptor(),
            manifest,
        })
    }

    async fn get_config(&self, image: &RemoteImage) -> Result<ConfigFile> {
        let reference = &image.reference;
        let blobs = &self.blobs(reference.registry());
        let digest = image.manifest.config.digest.as_str();
        let data = self
            .authorized(reference, PULL, move |auth| async move {
                blobs.get_blob(reference.repository(), digest, &auth).await
            })
            .await?;
        ConfigFile::from_slice(&data)
    }

    async fn write_index(&self, target: &ImageReference, index: &ImageIndex) -> Result<Descriptor> {
        for entry in index.entries() {
            if !entry.source.same_repository(target) {
                self.copy_image(&entry.source, target, &entry.descriptor.digest).await?;
            }
        }

        let data = &index.to_bytes()?;
        let manifests = &self.manifests(target.registry());
        self.authorized(target, PUSH, move |auth| async move {
            manifests
                .put_manifest(target.repository(), target.api_reference(), DOCKER_MANIFEST_LIST, data, &auth)
                .await
        })
        .await?;

        let descriptor = Descriptor::new(DOCKER_MANIFEST_LIST, data);
        self.output.success(&format!("Wrote {} ({})", target, descriptor.digest));
        Ok(descriptor)
    }
}
