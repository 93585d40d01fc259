//! Pipeline configuration and process environment
//!
//! [`PipelineConfig`] carries everything that decides *what* gets built and
//! where it is published. It can be loaded from a JSON file; every field has a
//! default, so an empty object (or no file at all) describes the standard
//! builder-jammy pipeline. [`Environment`] captures the process environment
//! once so the rest of the crate never reads global state.

use crate::error::{PipelineError, Result};
use crate::image::ImageReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

const VARIANT_PLACEHOLDER: &str = "{variant}";

/// Values read from the process environment
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Token for the release source and the GitHub container registry keychain
    pub github_token: Option<String>,
    pub github_actor: Option<String>,
    pub docker_host: Option<String>,
    pub docker_config: Option<PathBuf>,
    /// Comma separated override of the configured variants
    pub variants: Option<Vec<String>>,
}

impl Environment {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            github_token: non_empty("GITHUB_TOKEN"),
            github_actor: non_empty("GITHUB_ACTOR"),
            docker_host: non_empty("DOCKER_HOST"),
            docker_config: non_empty("DOCKER_CONFIG").map(PathBuf::from),
            variants: non_empty("UPDATE_BUILDER_VARIANTS").map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
        }
    }
}

/// A (variant, architecture) combination that is never built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub variant: String,
    pub architecture: String,
}

/// Static per-variant architecture exclusions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionTable(Vec<Exclusion>);

impl ExclusionTable {
    pub fn new(entries: Vec<Exclusion>) -> Self {
        Self(entries)
    }

    pub fn is_excluded(&self, variant: &str, architecture: &str) -> bool {
        self.0
            .iter()
            .any(|e| e.variant == variant && e.architecture == architecture)
    }
}

impl Default for ExclusionTable {
    /// The `full` variant is not published for arm64.
    fn default() -> Self {
        Self(vec![Exclusion {
            variant: "full".to_string(),
            architecture: "arm64".to_string(),
        }])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Builder variants processed by the CLI, in order
    pub variants: Vec<String>,
    /// Architectures built per variant; also the manifest list entry order
    pub architectures: Vec<String>,
    pub exclusions: ExclusionTable,
    /// Repository of the published manifest list, `{variant}` is substituted
    pub index_repository: String,
    /// Repository the single-architecture images are staged in
    pub staging_repository: String,
    pub release_owner: String,
    pub release_repository: String,
    /// Annotations of the manifest list and labels of the built images;
    /// `org.opencontainers.image.version` is added per release
    pub annotations: BTreeMap<String, String>,
    /// Registries reached over plain HTTP in addition to localhost
    pub insecure_registries: Vec<String>,
    pub pack_binary: String,
    pub docker_host: Option<String>,
    pub github_api_url: String,
    /// Timeout for registry and release API requests, in seconds
    pub timeout: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "org.opencontainers.image.description".to_string(),
            "Paketo Jammy builder enriched with Rust and Quarkus buildpack.".to_string(),
        );
        annotations.insert(
            "org.opencontainers.image.source".to_string(),
            "https://github.com/knative/func".to_string(),
        );
        annotations.insert(
            "org.opencontainers.image.vendor".to_string(),
            "https://github.com/knative/func".to_string(),
        );
        annotations.insert(
            "org.opencontainers.image.url".to_string(),
            "https://github.com/knative/func/pkgs/container/builder-jammy-{variant}".to_string(),
        );

        Self {
            variants: vec!["base".to_string()],
            architectures: vec!["amd64".to_string(), "arm64".to_string()],
            exclusions: ExclusionTable::default(),
            index_repository: "ghcr.io/knative/builder-jammy-{variant}".to_string(),
            staging_repository: "localhost:5000/knative/builder-jammy-{variant}".to_string(),
            release_owner: "paketo-buildpacks".to_string(),
            release_repository: "builder-jammy-{variant}".to_string(),
            annotations,
            insecure_registries: Vec::new(),
            pack_binary: "pack".to_string(),
            docker_host: None,
            github_api_url: "https://api.github.com".to_string(),
            timeout: 300,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    PipelineError::Config(format!("cannot parse {}: {}", path.display(), e))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Environment values override file values
    pub fn apply_env(mut self, env: &Environment) -> Self {
        if let Some(variants) = &env.variants {
            if !variants.is_empty() {
                self.variants = variants.clone();
            }
        }
        if env.docker_host.is_some() {
            self.docker_host = env.docker_host.clone();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(PipelineError::Config("at least one variant is required".to_string()));
        }
        if self.architectures.is_empty() {
            return Err(PipelineError::Config("at least one architecture is required".to_string()));
        }
        for (i, arch) in self.architectures.iter().enumerate() {
            if self.architectures[..i].contains(arch) {
                return Err(PipelineError::Config(format!("architecture {} listed twice", arch)));
            }
        }
        if self.timeout == 0 {
            return Err(PipelineError::Config("timeout must be greater than 0".to_string()));
        }
        for template in [&self.index_repository, &self.staging_repository] {
            // Probe the template with a concrete variant so malformed
            // repositories fail at startup rather than mid-pipeline.
            ImageReference::parse_strict(&format!("{}:probe", substitute(template, "base")))
                .map_err(|e| PipelineError::Config(format!("invalid repository template {}: {}", template, e)))?;
        }
        Ok(())
    }

    pub fn index_reference(&self, variant: &str, version: &str) -> Result<ImageReference> {
        ImageReference::parse_strict(&format!("{}:{}", substitute(&self.index_repository, variant), version))
    }

    pub fn staging_reference(&self, variant: &str, version: &str, architecture: &str) -> Result<ImageReference> {
        ImageReference::parse_strict(&format!(
            "{}:{}-{}",
            substitute(&self.staging_repository, variant),
            version,
            architecture
        ))
    }

    pub fn release_repository_for(&self, variant: &str) -> String {
        substitute(&self.release_repository, variant)
    }

    pub fn annotations_for(&self, variant: &str, version: &str) -> BTreeMap<String, String> {
        let mut annotations: BTreeMap<String, String> = self
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, variant)))
            .collect();
        annotations.insert("org.opencontainers.image.version".to_string(), version.to_string());
        annotations
    }
}

/// Loopback registries and explicitly listed ones are reached over plain HTTP
pub fn is_plain_http(registry: &str, insecure_registries: &[String]) -> bool {
    let host = registry.split(':').next().unwrap_or(registry);
    host == "localhost" || host == "127.0.0.1" || insecure_registries.iter().any(|r| r == registry)
}

fn substitute(template: &str, variant: &str) -> String {
    template.replace(VARIANT_PLACEHOLDER, variant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_builder_jammy() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.index_reference("base", "v0.4.283").unwrap().to_string(),
            "ghcr.io/knative/builder-jammy-base:v0.4.283"
        );
        assert_eq!(
            config.staging_reference("tiny", "v1", "arm64").unwrap().to_string(),
            "localhost:5000/knative/builder-jammy-tiny:v1-arm64"
        );
        assert_eq!(config.release_repository_for("full"), "builder-jammy-full");
    }

    #[test]
    fn full_variant_skips_arm64() {
        let config = PipelineConfig::default();
        assert!(config.exclusions.is_excluded("full", "arm64"));
        assert!(!config.exclusions.is_excluded("full", "amd64"));
        assert!(!config.exclusions.is_excluded("base", "arm64"));
    }

    #[test]
    fn annotations_carry_variant_and_version() {
        let annotations = PipelineConfig::default().annotations_for("tiny", "v2");
        assert_eq!(annotations["org.opencontainers.image.version"], "v2");
        assert_eq!(
            annotations["org.opencontainers.image.url"],
            "https://github.com/knative/func/pkgs/container/builder-jammy-tiny"
        );
    }

    #[test]
    fn loads_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{"variants":["tiny","full"],"exclusions":[{"variant":"tiny","architecture":"amd64"}]}"#,
        )
        .unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.variants, vec!["tiny", "full"]);
        assert!(config.exclusions.is_excluded("tiny", "amd64"));
        assert!(!config.exclusions.is_excluded("full", "arm64"));
        assert_eq!(config.architectures, vec!["amd64", "arm64"]);
    }

    #[test]
    fn rejects_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"architectures":[]}"#).unwrap();
        assert!(PipelineConfig::load(Some(&path)).is_err());

        std::fs::write(&path, r#"{"index_repository":"ghcr.io/Bad Repo"}"#).unwrap();
        assert!(PipelineConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn environment_overrides_variants() {
        let env = Environment {
            variants: Some(vec!["tiny".to_string()]),
            docker_host: Some("tcp://127.0.0.1:2375".to_string()),
            ..Default::default()
        };
        let config = PipelineConfig::default().apply_env(&env);
        assert_eq!(config.variants, vec!["tiny"]);
        assert_eq!(config.docker_host.as_deref(), Some("tcp://127.0.0.1:2375"));
    }

    #[test]
    fn localhost_is_plain_http() {
        let config = PipelineConfig::default();
        assert!(is_plain_http("localhost:5000", &config.insecure_registries));
        assert!(is_plain_http("127.0.0.1:5000", &config.insecure_registries));
        assert!(!is_plain_http("ghcr.io", &config.insecure_registries));
    }
}
