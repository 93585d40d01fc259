//! Manifest, descriptor and config wire types
//!
//! Only the parts of the Docker/OCI manifest formats needed to assemble a
//! manifest list from already pushed images are modelled here.

use crate::error::{PipelineError, Result};
use crate::image::digest::DigestUtils;
use crate::image::reference::ImageReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header for manifest requests
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Manifest kinds we can meet in a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestType {
    DockerV2,
    DockerList,
    OciManifest,
    OciIndex,
}

impl ManifestType {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        // Content-Type may carry parameters, e.g. "; charset=utf-8"
        let media_type = media_type.split(';').next().unwrap_or_default().trim();
        match media_type {
            DOCKER_MANIFEST_V2 => Some(Self::DockerV2),
            DOCKER_MANIFEST_LIST => Some(Self::DockerList),
            OCI_MANIFEST => Some(Self::OciManifest),
            OCI_INDEX => Some(Self::OciIndex),
            _ => None,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Self::DockerList | Self::OciIndex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub variant: Option<String>,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none", default)]
    pub os_version: Option<String>,
}

impl Platform {
    pub fn linux(architecture: &str) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
            os_version: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Content descriptor: (media type, size, digest) plus optional platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: &str, data: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            size: data.len() as u64,
            digest: DigestUtils::compute_docker_digest(data),
            platform: None,
            annotations: None,
        }
    }
}

/// Single-architecture image manifest (Docker v2 schema 2 or OCI)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(data)
            .map_err(|e| PipelineError::InvalidManifest(format!("cannot decode image manifest: {}", e)))?;
        if manifest.schema_version != 2 {
            return Err(PipelineError::InvalidManifest(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Blobs referenced by this manifest, config first
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// The parts of an image configuration file that describe its platform
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(rename = "os.version", default)]
    pub os_version: Option<String>,
}

impl ConfigFile {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| PipelineError::InvalidManifest(format!("cannot decode image config: {}", e)))
    }

    /// Platform recorded in the config; `None` if os or architecture is missing
    pub fn platform(&self) -> Option<Platform> {
        if self.os.is_empty() || self.architecture.is_empty() {
            return None;
        }
        Some(Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            variant: self.variant.clone().filter(|v| !v.is_empty()),
            os_version: self.os_version.clone().filter(|v| !v.is_empty()),
        })
    }
}

/// Docker manifest list as written to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Entry of an in-memory index: the descriptor written to the list and the
/// reference the image was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub descriptor: Descriptor,
    pub source: ImageReference,
}

/// In-memory manifest list under construction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageIndex {
    annotations: BTreeMap<String, String>,
    entries: Vec<IndexEntry>,
}

impl ImageIndex {
    pub fn new(annotations: BTreeMap<String, String>) -> Self {
        Self {
            annotations,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_manifest_list(&self) -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: DOCKER_MANIFEST_LIST.to_string(),
            manifests: self.entries.iter().map(|e| e.descriptor.clone()).collect(),
            annotations: if self.annotations.is_empty() {
                None
            } else {
                Some(self.annotations.clone())
            },
        }
    }

    /// Serialized manifest list; identical for identical entries and annotations
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_manifest_list())?)
    }

    pub fn descriptor(&self) -> Result<Descriptor> {
        Ok(Descriptor::new(DOCKER_MANIFEST_LIST, &self.to_bytes()?))
    }
}
