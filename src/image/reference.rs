//! Image reference parsing
//!
//! Turns `registry/repository:tag@digest` text into a validated [`ImageReference`].
//! Parsing never touches the network.

use crate::error::{PipelineError, Result};
use crate::image::digest::DigestUtils;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

static REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*(?::[0-9]{1,5})?$",
    )
    .expect("registry pattern is valid")
});

static PATH_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("path component pattern is valid")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern is valid"));

/// Whether a reference without tag or digest is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagPolicy {
    /// Missing tag becomes `latest`
    DefaultLatest,
    /// Missing tag and digest is an error
    Required,
}

/// A parsed, validated image reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse with `latest` as the default tag
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, TagPolicy::DefaultLatest)
    }

    /// Parse requiring an explicit tag or digest
    pub fn parse_strict(text: &str) -> Result<Self> {
        Self::parse_with(text, TagPolicy::Required)
    }

    pub fn parse_with(text: &str, policy: TagPolicy) -> Result<Self> {
        let invalid = |reason: &str| PipelineError::InvalidReference {
            reference: text.to_string(),
            reason: reason.to_string(),
        };

        if text.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if text.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name_and_tag, digest) = match text.split_once('@') {
            Some((name, digest)) => {
                if !DigestUtils::is_valid_docker_digest(digest) {
                    return Err(invalid("digest must be sha256: followed by 64 lowercase hex characters"));
                }
                (name, Some(digest.to_string()))
            }
            None => (text, None),
        };

        // A colon only separates a tag when it comes after the last slash,
        // otherwise it belongs to a registry port.
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&name_and_tag[..colon], Some(&name_and_tag[colon + 1..]))
            }
            _ => (name_and_tag, None),
        };

        if let Some(tag) = tag {
            if !TAG_RE.is_match(tag) {
                return Err(invalid("tag must match [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}"));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if registry.is_empty() || !REGISTRY_RE.is_match(&registry) {
            return Err(invalid("registry host is malformed"));
        }
        let registry = if registry == "docker.io" {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        if repository.is_empty() {
            return Err(invalid("repository path is empty"));
        }
        if !repository.split('/').all(|c| PATH_COMPONENT_RE.is_match(c)) {
            return Err(invalid(
                "repository path components must be lowercase alphanumerics separated by '.', '_', '__' or '-'",
            ));
        }
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        let tag = match (tag, &digest, policy) {
            (Some(tag), _, _) => Some(tag.to_string()),
            (None, Some(_), _) => None,
            (None, None, TagPolicy::DefaultLatest) => Some(DEFAULT_TAG.to_string()),
            (None, None, TagPolicy::Required) => return Err(invalid("an explicit tag or digest is required")),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository` without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The reference used in registry URLs: the digest when known, otherwise the tag
    pub fn api_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Same repository addressed by another tag
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        Self::parse_strict(&format!("{}:{}", self.name(), tag))
    }

    /// Same repository pinned by digest, without a tag
    pub fn pinned(&self, digest: &str) -> Result<Self> {
        Self::parse_strict(&format!("{}@{}", self.name(), digest))
    }

    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
