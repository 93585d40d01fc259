//! Variant loop, signal handling and exit reporting

use crate::builder::{PackCli, TarballConfigSource};
use crate::cli::args::Args;
use crate::config::{Environment, PipelineConfig};
use crate::error::Result;
use crate::logging::Logger;
use crate::pipeline::{cancellable, Orchestrator, PipelineOutcome};
use crate::publish::{DaemonClient, EngineClient};
use crate::registry::{AuthResolver, Registry, RegistryClient};
use crate::release::{GitHubReleases, ReleaseSource};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-variant results of one invocation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub published: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Runner {
    config: Arc<PipelineConfig>,
    env: Environment,
    output: Logger,
}

impl Runner {
    pub fn new(args: &Args, env: Environment) -> Result<Self> {
        let output = args.logger();
        let config = args.load_config(&env)?;
        Ok(Self {
            config: Arc::new(config),
            env,
            output,
        })
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    /// Wire up the production collaborators and process every variant.
    /// The first SIGINT/SIGTERM cancels the run, a second one exits with 130.
    pub async fn run(&self) -> Result<RunSummary> {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone(), self.output.clone());

        let timeout = Duration::from_secs(self.config.timeout);
        let auth = AuthResolver::from_environment(&self.env);
        let registry: Arc<dyn Registry> = Arc::new(
            RegistryClient::builder(auth.clone(), self.output.clone())
                .with_insecure_registries(self.config.insecure_registries.clone())
                .with_timeout(timeout)
                .build()?,
        );
        let daemon: Arc<dyn DaemonClient> =
            Arc::new(EngineClient::new(self.config.docker_host.as_deref(), self.output.clone())?);
        let mut orchestrator = Orchestrator::new(
            self.config.clone(),
            registry,
            daemon,
            auth,
            Arc::new(PackCli::new(self.config.pack_binary.clone(), self.output.clone())),
            Arc::new(TarballConfigSource::new(timeout, self.output.clone())?),
            self.output.clone(),
        );
        let releases = GitHubReleases::new(
            &self.config.github_api_url,
            self.env.github_token.clone(),
            timeout,
            self.output.clone(),
        )?;

        Ok(self.run_with(&mut orchestrator, &releases, &cancel).await)
    }

    /// Process each configured variant inside its own CI log group.
    /// A failing variant does not stop the following ones.
    pub async fn run_with(
        &self,
        orchestrator: &mut Orchestrator,
        releases: &dyn ReleaseSource,
        cancel: &CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::default();

        for variant in &self.config.variants {
            self.output.group(variant);
            let result = self.run_variant(orchestrator, releases, variant, cancel).await;
            match result {
                Ok(PipelineOutcome::AlreadyPublished { .. }) => summary.skipped.push(variant.clone()),
                Ok(PipelineOutcome::Published { .. }) => summary.published.push(variant.clone()),
                Err(e) => {
                    self.output.error(&e.to_string());
                    summary.failed.push(variant.clone());
                }
            }
            self.output.end_group();
        }

        self.output.summary_kv(
            "Summary",
            &[
                ("Published", summary.published.join(", ")),
                ("Already published", summary.skipped.join(", ")),
                ("Failed", summary.failed.join(", ")),
                ("Elapsed", self.output.format_duration(self.output.elapsed())),
            ],
        );
        summary
    }

    async fn run_variant(
        &self,
        orchestrator: &mut Orchestrator,
        releases: &dyn ReleaseSource,
        variant: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let repository = self.config.release_repository_for(variant);
        let release = cancellable(
            cancel,
            releases.latest_release(&self.config.release_owner, &repository),
        )
        .await?;
        orchestrator.run(variant, &release, cancel).await
    }
}

/// Cancel on the first interrupt, exit with 130 on the second
pub fn spawn_signal_handler(cancel: CancellationToken, output: Logger) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            output.debug(&format!("cannot listen for signals: {}", e));
            return;
        }
        output.warning("Interrupted, cancelling (interrupt again to exit immediately)");
        cancel.cancel();
        if wait_for_signal().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
