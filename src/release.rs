//! Upstream builder releases

use crate::error::{PipelineError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

/// The release a builder is rebuilt from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// Release name; used as the version tag of the published index
    pub name: String,
    pub tarball_url: String,
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_release(&self, owner: &str, repository: &str) -> Result<Release>;
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    name: Option<String>,
    tarball_url: Option<String>,
}

/// GitHub REST releases API
#[derive(Debug, Clone)]
pub struct GitHubReleases {
    client: Client,
    api_url: String,
    token: Option<String>,
    output: Logger,
}

impl GitHubReleases {
    pub fn new(api_url: &str, token: Option<String>, timeout: Duration, output: Logger) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            output,
        })
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleases {
    /// Most recent release as listed by the API, drafts and prereleases included
    async fn latest_release(&self, owner: &str, repository: &str) -> Result<Release> {
        let full_name = format!("{}/{}", owner, repository);
        let release_error = |message: String| PipelineError::Release {
            repository: full_name.clone(),
            message,
        };

        let url = format!("{}/repos/{}/releases", self.api_url, full_name);
        self.output.detail(&format!("Listing releases from {}", url));

        let mut request = self
            .client
            .get(&url)
            .query(&[("per_page", "1")])
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("update-builder/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| release_error(format!("cannot get upstream builder release: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(release_error(format!("GitHub API returned {}: {}", status, text.trim())));
        }

        let releases: Vec<GitHubRelease> = response
            .json()
            .await
            .map_err(|e| release_error(format!("cannot decode releases: {}", e)))?;
        let release = releases
            .into_iter()
            .next()
            .ok_or_else(|| release_error("cannot get latest release".to_string()))?;

        let name = release
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| release_error("the name of the release is not defined".to_string()))?;
        let tarball_url = release
            .tarball_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| release_error("the tarball url of the release is not defined".to_string()))?;

        self.output.info(&format!("releaseURL: '{}'", tarball_url));
        Ok(Release {
            name,
            tarball_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_api_payload() {
        let payload = r#"[{"name":"v0.4.283","tag_name":"v0.4.283","tarball_url":"https://api.github.com/repos/paketo-buildpacks/builder-jammy-base/tarball/v0.4.283","draft":false}]"#;
        let releases: Vec<GitHubRelease> = serde_json::from_str(payload).unwrap();
        assert_eq!(releases[0].name.as_deref(), Some("v0.4.283"));
        assert!(releases[0].tarball_url.as_deref().unwrap().ends_with("/tarball/v0.4.283"));
    }

    #[test]
    fn api_url_is_normalized() {
        let source = GitHubReleases::new("https://api.github.com/", None, Duration::from_secs(5), Logger::new_quiet())
            .unwrap();
        assert_eq!(source.api_url, "https://api.github.com");
    }
}
