//! Existence checks against a registry

use crate::error::Result;
use crate::image::{Descriptor, ImageReference};
use crate::logging::Logger;
use crate::registry::client::Registry;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Existence {
    Found(Descriptor),
    NotFound,
}

impl Existence {
    pub fn is_found(&self) -> bool {
        matches!(self, Existence::Found(_))
    }
}

/// Answers whether a reference resolves in its registry. Only a 404 means
/// absent; every other failure is returned as an error.
#[derive(Clone)]
pub struct ExistenceProbe {
    registry: Arc<dyn Registry>,
    output: Logger,
}

impl ExistenceProbe {
    pub fn new(registry: Arc<dyn Registry>, output: Logger) -> Self {
        Self { registry, output }
    }

    pub async fn exists(&self, reference: &ImageReference) -> Result<Existence> {
        match self.registry.head(reference).await {
            Ok(descriptor) => {
                self.output
                    .detail(&format!("{} exists ({})", reference, descriptor.digest));
                Ok(Existence::Found(descriptor))
            }
            Err(e) if e.is_not_found() => {
                self.output.detail(&format!("{} not found", reference));
                Ok(Existence::NotFound)
            }
            Err(e) => Err(e),
        }
    }
}
