//! Local builder collaborators
//!
//! [`TarballConfigSource`] pulls `builder.toml` out of an upstream release
//! tarball and [`PackCli`] turns it into a single-architecture builder image
//! in the local daemon.

use crate::error::{PipelineError, Result};
use crate::logging::Logger;
use crate::release::Release;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const BUILDER_TOML: &str = "builder.toml";

/// One `pack builder create` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Tagged image name created in the local daemon
    pub image: String,
    pub config_path: PathBuf,
    /// `os/arch`, e.g. `linux/arm64`
    pub platform: String,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait LocalBuilder: Send + Sync {
    async fn build(&self, spec: &BuildSpec, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
pub trait BuilderConfigSource: Send + Sync {
    /// Store the release's builder configuration in `dest_dir`, returning its path
    async fn fetch(&self, release: &Release, dest_dir: &Path) -> Result<PathBuf>;
}

/// Runs the `pack` CLI
#[derive(Debug, Clone)]
pub struct PackCli {
    binary: String,
    output: Logger,
}

impl PackCli {
    pub fn new(binary: impl Into<String>, output: Logger) -> Self {
        Self {
            binary: binary.into(),
            output,
        }
    }

    fn arguments(spec: &BuildSpec) -> Vec<String> {
        let mut args = vec![
            "builder".to_string(),
            "create".to_string(),
            spec.image.clone(),
            "--config".to_string(),
            spec.config_path.display().to_string(),
            "--target".to_string(),
            spec.platform.clone(),
            "--pull-policy".to_string(),
            "always".to_string(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}

#[async_trait]
impl LocalBuilder for PackCli {
    async fn build(&self, spec: &BuildSpec, cancel: &CancellationToken) -> Result<()> {
        let build_error = |message: String| PipelineError::Build {
            image: spec.image.clone(),
            message,
        };

        self.output.info(&format!("builderImage: '{}'", spec.image));
        let args = Self::arguments(spec);
        self.output.verbose(&format!("{} {}", self.binary, args.join(" ")));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| build_error(format!("cannot run {}: {}", self.binary, e)))?;

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    self.output.debug(&format!("cannot stop {}: {}", self.binary, e));
                }
                return Err(PipelineError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(build_error(format!("{} exited with {}", self.binary, status)));
        }
        Ok(())
    }
}

/// Downloads the release tarball and extracts its `builder.toml`
#[derive(Debug, Clone)]
pub struct TarballConfigSource {
    client: reqwest::Client,
    output: Logger,
}

impl TarballConfigSource {
    pub fn new(timeout: Duration, output: Logger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("update-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot create HTTP client: {}", e)))?;
        Ok(Self { client, output })
    }
}

#[async_trait]
impl BuilderConfigSource for TarballConfigSource {
    async fn fetch(&self, release: &Release, dest_dir: &Path) -> Result<PathBuf> {
        let release_error = |message: String| PipelineError::Release {
            repository: release.tarball_url.clone(),
            message,
        };

        self.output.detail(&format!("Downloading {}", release.tarball_url));
        let response = self
            .client
            .get(&release.tarball_url)
            .send()
            .await
            .map_err(|e| release_error(format!("cannot get release tarball: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(release_error(format!("release tarball returned {}", status)));
        }
        let data = response
            .bytes()
            .await
            .map_err(|e| release_error(format!("cannot read release tarball: {}", e)))?;

        let destination = dest_dir.join(BUILDER_TOML);
        let target = destination.clone();
        tokio::task::spawn_blocking(move || extract_builder_toml(&data[..], &target))
            .await
            .map_err(|e| release_error(format!("extraction task failed: {}", e)))?
            .map_err(|e| release_error(e.to_string()))?;

        self.output.detail(&format!("builder.toml stored at {}", destination.display()));
        Ok(destination)
    }
}

/// Copy the first regular file whose path ends in `/builder.toml` out of a
/// gzip-compressed tar stream
pub fn extract_builder_toml(tarball: impl Read, destination: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(tarball));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        if !path.ends_with(&format!("/{}", BUILDER_TOML)) {
            continue;
        }
        let mut file = std::fs::File::create(destination)?;
        std::io::copy(&mut entry, &mut file)?;
        return Ok(());
    }
    Err(PipelineError::InvalidManifest("release tarball contains no builder.toml".to_string()))
}
