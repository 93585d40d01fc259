//! Per-variant publishing pipeline
//!
//! The [`Orchestrator`] walks one variant through
//! `Start -> ProbeExisting -> {AlreadyPublished | NeedsBuild} -> BuildLoop(arch)...
//! -> Assemble -> PublishVersioned -> PublishLatest -> Done`, landing in
//! `Failed` on the first error. Nothing is written to the index repository
//! before every architecture has been staged and described.

use crate::builder::{BuildSpec, BuilderConfigSource, LocalBuilder};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::image::{Descriptor, ImageReference};
use crate::index::IndexAssembler;
use crate::logging::Logger;
use crate::publish::{DaemonClient, ImagePublisher};
use crate::registry::{AuthResolver, Existence, ExistenceProbe, Registry};
use crate::release::Release;
use crate::with_context;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    ProbeExisting,
    AlreadyPublished,
    NeedsBuild,
    BuildLoop(String),
    Assemble,
    PublishVersioned,
    PublishLatest,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::BuildLoop(arch) => write!(f, "BuildLoop({})", arch),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The versioned index already existed; nothing was built
    AlreadyPublished { reference: ImageReference },
    Published {
        versioned: ImageReference,
        latest: ImageReference,
        descriptor: Descriptor,
        architectures: Vec<String>,
    },
}

/// Run `future` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = future => result,
    }
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    probe: ExistenceProbe,
    publisher: ImagePublisher,
    assembler: IndexAssembler,
    builder: Arc<dyn LocalBuilder>,
    config_source: Arc<dyn BuilderConfigSource>,
    output: Logger,
    history: Vec<PipelineState>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        registry: Arc<dyn Registry>,
        daemon: Arc<dyn DaemonClient>,
        auth: AuthResolver,
        builder: Arc<dyn LocalBuilder>,
        config_source: Arc<dyn BuilderConfigSource>,
        output: Logger,
    ) -> Self {
        Self {
            config,
            probe: ExistenceProbe::new(registry.clone(), output.clone()),
            publisher: ImagePublisher::new(daemon, auth, output.clone()),
            assembler: IndexAssembler::new(registry, output.clone()),
            builder,
            config_source,
            output,
            history: Vec::new(),
        }
    }

    /// States visited by the last run, in order
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn state(&self) -> Option<&PipelineState> {
        self.history.last()
    }

    fn transition(&mut self, state: PipelineState) {
        self.output.detail(&format!("state: {}", state));
        self.history.push(state);
    }

    pub async fn run(
        &mut self,
        variant: &str,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        self.history.clear();
        self.transition(PipelineState::Start);
        self.output.section(&format!("Building builder-jammy-{} {}", variant, release.name));

        let result = self.execute(variant, release, cancel).await;
        match &result {
            Ok(_) => {}
            Err(e) => {
                self.output.debug(&format!("pipeline failed: {}", e));
                self.transition(PipelineState::Failed);
            }
        }
        result
    }

    async fn execute(
        &mut self,
        variant: &str,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let version = release.name.as_str();
        let versioned = with_context!(
            self.config.index_reference(variant, version),
            "cannot parse image index ref"
        )?;

        self.transition(PipelineState::ProbeExisting);
        let existence = with_context!(
            cancellable(cancel, self.probe.exists(&versioned)).await,
            "cannot get image index {}",
            versioned
        )?;
        if existence.is_found() {
            self.output.info(&format!("index already present for tag: {}", version));
            self.transition(PipelineState::AlreadyPublished);
            return Ok(PipelineOutcome::AlreadyPublished { reference: versioned });
        }
        self.transition(PipelineState::NeedsBuild);

        let workdir = tempfile::tempdir()?;
        self.output.detail(&format!("builderDir: '{}'", workdir.path().display()));
        let config_path = with_context!(
            cancellable(cancel, self.config_source.fetch(release, workdir.path())).await,
            "cannot download builder toml"
        )?;

        let config = self.config.clone();
        let mut staged = Vec::new();
        let mut architectures = Vec::new();
        for arch in &config.architectures {
            if config.exclusions.is_excluded(variant, arch) {
                self.output
                    .warning(&format!("skipping {} build for variant: {:?}", arch, variant));
                continue;
            }
            self.transition(PipelineState::BuildLoop(arch.clone()));
            let image = with_context!(
                self.stage(variant, version, arch, &config_path, cancel).await,
                "cannot build the image for {}",
                arch
            )?;
            staged.push(image);
            architectures.push(arch.clone());
        }

        self.transition(PipelineState::Assemble);
        let mut index = self.assembler.new_index(config.annotations_for(variant, version));
        for (image, arch) in staged.iter().zip(&architectures) {
            index = with_context!(
                cancellable(cancel, self.assembler.append(index, image)).await,
                "cannot add the {} image to the index",
                arch
            )?;
        }

        self.transition(PipelineState::PublishVersioned);
        let descriptor = with_context!(
            cancellable(cancel, self.assembler.publish(&index, &versioned)).await,
            "cannot write image index"
        )?;

        let latest = versioned.with_tag("latest")?;
        self.transition(PipelineState::PublishLatest);
        with_context!(
            cancellable(cancel, self.assembler.publish(&index, &latest)).await,
            "cannot write image index (latest)"
        )?;

        self.transition(PipelineState::Done);
        self.output.success(&format!("Published {} ({})", versioned, descriptor.digest));
        Ok(PipelineOutcome::Published {
            versioned,
            latest,
            descriptor,
            architectures,
        })
    }

    /// Make sure `<staging>:<version>-<arch>` exists and return it pinned by digest
    async fn stage(
        &self,
        variant: &str,
        version: &str,
        arch: &str,
        config_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImageReference> {
        let target = self.config.staging_reference(variant, version, arch)?;

        let existence = cancellable(cancel, self.probe.exists(&target)).await?;
        if let Existence::Found(descriptor) = existence {
            self.output.warning("The image has been already built.");
            return target.pinned(&descriptor.digest);
        }

        let spec = BuildSpec {
            image: target.to_string(),
            config_path: config_path.to_path_buf(),
            platform: format!("linux/{}", arch),
            labels: self.config.annotations_for(variant, version),
        };
        with_context!(self.builder.build(&spec, cancel).await, "cannot create builder")?;

        let digest = with_context!(
            self.publisher.push(&target, cancel).await,
            "cannot push the image"
        )?;
        target.pinned(&digest)
    }
}
