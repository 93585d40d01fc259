//! Layered registry credential resolution
//!
//! An [`AuthResolver`] owns an ordered list of [`Keychain`]s. For a given
//! registry host the first keychain that knows a credential wins; when none
//! does, the anonymous credential is returned. A keychain failure is never
//! skipped: it aborts resolution so a misconfigured credential store cannot
//! silently degrade a push into an unauthenticated one.

use crate::config::Environment;
use crate::error::{PipelineError, Result};
use crate::image::ImageReference;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DOCKER_HUB_CONFIG_KEY: &str = "https://index.docker.io/v1/";
const GITHUB_REGISTRIES: &[&str] = &["ghcr.io", "docker.pkg.github.com"];

/// Username/password pair for one registry. Empty fields mean anonymous.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// Opaque token for the daemon's `X-Registry-Auth` header
    pub fn daemon_auth_token(&self) -> Result<String> {
        let body = serde_json::to_vec(&serde_json::json!({
            "username": self.username,
            "password": self.password,
        }))?;
        Ok(URL_SAFE.encode(body))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// One credential source in the resolution chain
#[async_trait]
pub trait Keychain: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when this keychain has nothing for the registry
    async fn resolve(&self, registry: &str) -> Result<Option<Credential>>;
}

/// GitHub container registry credentials from the workflow token
#[derive(Debug, Clone, Default)]
pub struct GitHubKeychain {
    token: Option<String>,
    actor: Option<String>,
}

impl GitHubKeychain {
    pub fn new(token: Option<String>, actor: Option<String>) -> Self {
        Self { token, actor }
    }

    pub fn from_env(env: &Environment) -> Self {
        Self::new(env.github_token.clone(), env.github_actor.clone())
    }
}

#[async_trait]
impl Keychain for GitHubKeychain {
    fn name(&self) -> &str {
        "github"
    }

    async fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        if !GITHUB_REGISTRIES.contains(&registry) {
            return Ok(None);
        }
        Ok(self.token.as_ref().map(|token| {
            let username = self.actor.clone().unwrap_or_else(|| "unset".to_string());
            Credential::new(username, token.clone())
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(rename = "credHelpers", default)]
    cred_helpers: HashMap<String, String>,
    #[serde(rename = "credsStore", default)]
    creds_store: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Credentials from the docker CLI configuration (`config.json` and credential helpers)
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    config_dir: Option<PathBuf>,
}

impl DockerConfigKeychain {
    pub fn new(config_dir: Option<PathBuf>) -> Self {
        Self { config_dir }
    }

    /// `$DOCKER_CONFIG`, falling back to `~/.docker`
    pub fn from_env(env: &Environment) -> Self {
        let config_dir = env
            .docker_config
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")));
        Self::new(config_dir)
    }

    async fn load(&self) -> Result<Option<DockerConfigFile>> {
        let Some(dir) = &self.config_dir else {
            return Ok(None);
        };
        let path = dir.join("config.json");
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::Io(e)),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    async fn run_helper(&self, helper: &str, server: &str) -> Result<Option<Credential>> {
        let program = format!("docker-credential-{}", helper);
        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Config(format!("cannot run {}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(server.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            if stdout.contains("credentials not found") {
                return Ok(None);
            }
            return Err(PipelineError::Config(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stdout.trim()
            )));
        }

        let response: HelperResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Config(format!("cannot decode {} output: {}", program, e)))?;
        Ok(Some(Credential::new(response.username, response.secret)))
    }
}

/// Host part of a config.json key such as `https://index.docker.io/v1/`
fn config_key_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}

fn same_registry(key: &str, registry: &str) -> bool {
    let host = config_key_host(key);
    let is_hub = |h: &str| matches!(h, "index.docker.io" | "docker.io" | "registry-1.docker.io");
    host == registry || (is_hub(host) && is_hub(registry))
}

fn decode_auth_entry(entry: &AuthEntry) -> Result<Option<Credential>> {
    if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
        let decoded = STANDARD
            .decode(auth)
            .map_err(|e| PipelineError::Config(format!("malformed auth entry: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| PipelineError::Config(format!("malformed auth entry: {}", e)))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| PipelineError::Config("malformed auth entry: missing ':'".to_string()))?;
        return Ok(Some(Credential::new(username, password)));
    }
    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some(Credential::new(username.clone(), password.clone())));
    }
    if let Some(token) = entry.identitytoken.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Some(Credential::new("<token>", token)));
    }
    Ok(None)
}

#[async_trait]
impl Keychain for DockerConfigKeychain {
    fn name(&self) -> &str {
        "docker-config"
    }

    async fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        let Some(config) = self.load().await? else {
            return Ok(None);
        };

        let server = if same_registry(DOCKER_HUB_CONFIG_KEY, registry) {
            DOCKER_HUB_CONFIG_KEY.to_string()
        } else {
            registry.to_string()
        };

        let helper = config
            .cred_helpers
            .iter()
            .find(|(key, _)| same_registry(key, registry))
            .map(|(_, helper)| helper.clone())
            .or(config.creds_store.clone())
            .filter(|h| !h.is_empty());
        if let Some(helper) = helper {
            if let Some(credential) = self.run_helper(&helper, &server).await? {
                return Ok(Some(credential));
            }
        }

        // Exact key first, then any key naming the same host
        let entry = config.auths.get(&server).or_else(|| {
            config
                .auths
                .iter()
                .find(|(key, _)| same_registry(key, registry))
                .map(|(_, entry)| entry)
        });
        match entry {
            Some(entry) => decode_auth_entry(entry),
            None => Ok(None),
        }
    }
}

/// Ordered credential chain, constructed explicitly and passed to every
/// component that talks to a registry or the daemon
#[derive(Clone)]
pub struct AuthResolver {
    keychains: Vec<Arc<dyn Keychain>>,
}

impl AuthResolver {
    pub fn new(keychains: Vec<Arc<dyn Keychain>>) -> Self {
        Self { keychains }
    }

    /// GitHub keychain first, docker configuration as the generic fallback
    pub fn from_environment(env: &Environment) -> Self {
        Self::new(vec![
            Arc::new(GitHubKeychain::from_env(env)),
            Arc::new(DockerConfigKeychain::from_env(env)),
        ])
    }

    pub async fn resolve(&self, reference: &ImageReference) -> Result<Credential> {
        self.resolve_registry(reference.registry()).await
    }

    pub async fn resolve_registry(&self, registry: &str) -> Result<Credential> {
        for keychain in &self.keychains {
            match keychain.resolve(registry).await {
                Ok(Some(credential)) if !credential.is_anonymous() => return Ok(credential),
                Ok(_) => continue,
                Err(err @ PipelineError::Auth { .. }) => return Err(err),
                Err(err) => {
                    return Err(PipelineError::Auth {
                        registry: registry.to_string(),
                        keychain: keychain.name().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(Credential::anonymous())
    }
}

impl fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.keychains.iter().map(|k| k.name()).collect();
        f.debug_struct("AuthResolver").field("keychains", &names).finish()
    }
}
