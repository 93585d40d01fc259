//! Manifest list assembly
//!
//! [`IndexAssembler`] turns pushed single-architecture images into entries of
//! an [`ImageIndex`] and writes the finished list. The platform of every entry
//! is read from the image's own config file; whatever the registry reported
//! for the descriptor is replaced.

use crate::error::{PipelineError, Result};
use crate::image::{Descriptor, ImageIndex, ImageReference, IndexEntry};
use crate::logging::Logger;
use crate::registry::client::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct IndexAssembler {
    registry: Arc<dyn Registry>,
    output: Logger,
}

impl IndexAssembler {
    pub fn new(registry: Arc<dyn Registry>, output: Logger) -> Self {
        Self { registry, output }
    }

    pub fn new_index(&self, annotations: BTreeMap<String, String>) -> ImageIndex {
        ImageIndex::new(annotations)
    }

    /// Append the image `reference` points at
    pub async fn append(&self, mut index: ImageIndex, reference: &ImageReference) -> Result<ImageIndex> {
        let entry = self.describe(reference).await.map_err(|source| PipelineError::Descriptor {
            reference: reference.to_string(),
            source: Box::new(source),
        })?;
        self.output.info(&format!(
            "Adding {} ({}) to the index",
            entry.source,
            entry.descriptor.platform.as_ref().map(ToString::to_string).unwrap_or_default()
        ));
        index.push(entry);
        Ok(index)
    }

    async fn describe(&self, reference: &ImageReference) -> Result<IndexEntry> {
        let image = self.registry.get_image(reference).await?;
        let config = self.registry.get_config(&image).await?;
        let platform = config.platform().ok_or_else(|| {
            PipelineError::InvalidManifest(format!(
                "config of {} does not name an os and architecture",
                image.reference
            ))
        })?;

        let mut descriptor = image.descriptor;
        descriptor.platform = Some(platform);
        Ok(IndexEntry {
            descriptor,
            source: image.reference,
        })
    }

    /// Write the index under `reference`. An index without entries is never written.
    pub async fn publish(&self, index: &ImageIndex, reference: &ImageReference) -> Result<Descriptor> {
        if index.is_empty() {
            return Err(PipelineError::InvalidManifest(format!(
                "refusing to write {} without any image",
                reference
            )));
        }
        self.output.step(&format!("Writing {}", reference));
        self.registry
            .write_index(reference, index)
            .await
            .map_err(|source| PipelineError::Write {
                reference: reference.to_string(),
                source: Box::new(source),
            })
    }
}
