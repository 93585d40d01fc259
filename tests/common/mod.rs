//! In-memory collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use update_builder::builder::{BuildSpec, BuilderConfigSource, LocalBuilder};
use update_builder::config::PipelineConfig;
use update_builder::image::manifest::DOCKER_MANIFEST_V2;
use update_builder::image::{ConfigFile, Descriptor, DigestUtils, ImageIndex, ImageManifest, ImageReference, Platform};
use update_builder::logging::Logger;
use update_builder::pipeline::Orchestrator;
use update_builder::publish::{DaemonClient, ProgressStream};
use update_builder::registry::{AuthResolver, Registry, RemoteImage};
use update_builder::release::{Release, ReleaseSource};
use update_builder::{PipelineError, Result};

pub const VERSION: &str = "v0.4.283";

pub fn release() -> Release {
    Release {
        name: VERSION.to_string(),
        tarball_url: "https://example.invalid/builder.tar.gz".to_string(),
    }
}

#[derive(Clone)]
struct StoredImage {
    descriptor: Descriptor,
    manifest: ImageManifest,
    architecture: String,
}

/// Registry holding staged images and written indexes
#[derive(Default)]
pub struct FakeRegistry {
    images: Mutex<HashMap<String, StoredImage>>,
    indexes: Mutex<HashMap<String, Descriptor>>,
    pub index_writes: Mutex<Vec<(String, Vec<u8>)>>,
    /// Status returned by every HEAD when set
    pub head_status: Mutex<Option<u16>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a single-architecture image under its tag and its digest
    pub fn stage(&self, reference: &ImageReference, architecture: &str) -> String {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(DOCKER_MANIFEST_V2.to_string()),
            config: Descriptor::new(
                "application/vnd.docker.container.image.v1+json",
                format!("config {} {}", reference, architecture).as_bytes(),
            ),
            layers: Vec::new(),
        };
        let data = serde_json::to_vec(&manifest).unwrap();
        let mut descriptor = Descriptor::new(DOCKER_MANIFEST_V2, &data);
        // What a registry might report; the index must not trust it
        descriptor.platform = Some(Platform::linux("s390x"));

        let stored = StoredImage {
            descriptor: descriptor.clone(),
            manifest,
            architecture: architecture.to_string(),
        };
        let pinned = reference.pinned(&descriptor.digest).unwrap();
        let mut images = self.images.lock().unwrap();
        images.insert(reference.to_string(), stored.clone());
        images.insert(pinned.to_string(), stored);
        descriptor.digest
    }

    pub fn index_write_count(&self) -> usize {
        self.index_writes.lock().unwrap().len()
    }

    fn lookup(&self, reference: &ImageReference) -> Option<StoredImage> {
        self.images.lock().unwrap().get(&reference.to_string()).cloned()
    }

    fn not_found(operation: &str, reference: &ImageReference) -> PipelineError {
        PipelineError::transport(operation, reference.to_string(), Some(404), "not found")
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn head(&self, reference: &ImageReference) -> Result<Descriptor> {
        if let Some(status) = *self.head_status.lock().unwrap() {
            return Err(PipelineError::transport("HEAD manifest", reference.to_string(), Some(status), "fault"));
        }
        if let Some(descriptor) = self.indexes.lock().unwrap().get(&reference.to_string()) {
            return Ok(descriptor.clone());
        }
        self.lookup(reference)
            .map(|image| image.descriptor)
            .ok_or_else(|| Self::not_found("HEAD manifest", reference))
    }

    async fn get_image(&self, reference: &ImageReference) -> Result<RemoteImage> {
        let image = self
            .lookup(reference)
            .ok_or_else(|| Self::not_found("GET manifest", reference))?;
        Ok(RemoteImage {
            reference: reference.pinned(&image.descriptor.digest)?,
            descriptor: image.descriptor,
            manifest: image.manifest,
        })
    }

    async fn get_config(&self, image: &RemoteImage) -> Result<ConfigFile> {
        let stored = self
            .lookup(&image.reference)
            .ok_or_else(|| Self::not_found("GET blob", &image.reference))?;
        ConfigFile::from_slice(format!(r#"{{"architecture":"{}","os":"linux"}}"#, stored.architecture).as_bytes())
    }

    async fn write_index(&self, target: &ImageReference, index: &ImageIndex) -> Result<Descriptor> {
        let data = index.to_bytes()?;
        let descriptor = index.descriptor()?;
        self.index_writes.lock().unwrap().push((target.to_string(), data));
        self.indexes
            .lock()
            .unwrap()
            .insert(target.to_string(), descriptor.clone());
        Ok(descriptor)
    }
}

fn architecture_of_tag(tag: &str) -> String {
    tag.rsplit('-').next().unwrap_or_default().to_string()
}

/// Daemon that "pushes" into the fake registry and reports the digest
/// through a realistic progress stream
pub struct FakeDaemon {
    registry: Arc<FakeRegistry>,
    pub pushes: Mutex<Vec<String>>,
}

impl FakeDaemon {
    pub fn new(registry: Arc<FakeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pushes: Mutex::new(Vec::new()),
        })
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }
}

#[async_trait]
impl DaemonClient for FakeDaemon {
    async fn push_image(&self, image: &str, tag: &str, _registry_auth: &str) -> Result<ProgressStream> {
        let reference = ImageReference::parse_strict(&format!("{}:{}", image, tag))?;
        self.pushes.lock().unwrap().push(reference.to_string());
        let digest = self.registry.stage(&reference, &architecture_of_tag(tag));

        let records = vec![
            format!("{{\"status\":\"The push refers to repository [{}]\"}}\n", image),
            "{\"status\":\"Preparing\",\"progressDetail\":{},\"id\":\"5f70bf18a086\"}\n".to_string(),
            "{\"status\":\"Pushed\",\"progressDetail\":{},\"id\":\"5f70bf18a086\"}\n".to_string(),
            format!("{{\"status\":\"{}: digest: {} size: 528\"}}\n", tag, digest),
            format!(
                "{{\"progressDetail\":{{}},\"aux\":{{\"Tag\":\"{}\",\"Digest\":\"{}\",\"Size\":528}}}}\n",
                tag, digest
            ),
        ];
        let chunks: Vec<io::Result<Bytes>> = records.into_iter().map(|r| Ok(Bytes::from(r))).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Local builder recording what it was asked to build
#[derive(Default)]
pub struct FakeBuilder {
    pub builds: Mutex<Vec<BuildSpec>>,
    /// Platform whose build fails, e.g. `linux/arm64`
    pub failing_platform: Mutex<Option<String>>,
}

impl FakeBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, platform: &str) {
        *self.failing_platform.lock().unwrap() = Some(platform.to_string());
    }

    pub fn built_platforms(&self) -> Vec<String> {
        self.builds.lock().unwrap().iter().map(|b| b.platform.clone()).collect()
    }
}

#[async_trait]
impl LocalBuilder for FakeBuilder {
    async fn build(&self, spec: &BuildSpec, _cancel: &CancellationToken) -> Result<()> {
        assert!(spec.config_path.exists(), "builder.toml must be present while building");
        self.builds.lock().unwrap().push(spec.clone());
        if self.failing_platform.lock().unwrap().as_deref() == Some(spec.platform.as_str()) {
            return Err(PipelineError::Build {
                image: spec.image.clone(),
                message: "pack exited with exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Writes a stub builder.toml
#[derive(Default)]
pub struct FakeConfigSource {
    pub fetches: Mutex<usize>,
}

#[async_trait]
impl BuilderConfigSource for FakeConfigSource {
    async fn fetch(&self, _release: &Release, dest_dir: &Path) -> Result<PathBuf> {
        *self.fetches.lock().unwrap() += 1;
        let path = dest_dir.join("builder.toml");
        tokio::fs::write(&path, "description = \"test builder\"\n").await?;
        Ok(path)
    }
}

/// Release source answering with a fixed release, or failing for listed repositories
pub struct StaticReleases {
    pub failing_repositories: Vec<String>,
}

#[async_trait]
impl ReleaseSource for StaticReleases {
    async fn latest_release(&self, owner: &str, repository: &str) -> Result<Release> {
        if self.failing_repositories.iter().any(|r| r == repository) {
            return Err(PipelineError::Release {
                repository: format!("{}/{}", owner, repository),
                message: "cannot get latest release".to_string(),
            });
        }
        Ok(release())
    }
}

pub struct World {
    pub registry: Arc<FakeRegistry>,
    pub daemon: Arc<FakeDaemon>,
    pub builder: Arc<FakeBuilder>,
    pub config_source: Arc<FakeConfigSource>,
}

impl World {
    pub fn new() -> Self {
        let registry = FakeRegistry::new();
        Self {
            daemon: FakeDaemon::new(registry.clone()),
            registry,
            builder: FakeBuilder::new(),
            config_source: Arc::new(FakeConfigSource::default()),
        }
    }

    pub fn orchestrator(&self, config: PipelineConfig) -> Orchestrator {
        Orchestrator::new(
            Arc::new(config),
            self.registry.clone(),
            self.daemon.clone(),
            AuthResolver::new(Vec::new()),
            self.builder.clone(),
            self.config_source.clone(),
            Logger::new_quiet(),
        )
    }
}

pub fn staged(variant: &str, arch: &str) -> ImageReference {
    PipelineConfig::default().staging_reference(variant, VERSION, arch).unwrap()
}

pub fn digest_of(data: &[u8]) -> String {
    DigestUtils::compute_docker_digest(data)
}
