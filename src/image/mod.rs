//! Image references, digests and manifest types
//!
//! This module provides the value types shared by every pipeline stage:
//! [`ImageReference`] for parsing `registry/repository:tag@digest` text,
//! [`DigestUtils`] for content addressing, and the manifest wire types used to
//! describe pushed images and the manifest list assembled from them.

pub mod digest;
pub mod manifest;
pub mod reference;

pub use digest::DigestUtils;
pub use manifest::{
    ConfigFile, Descriptor, ImageIndex, ImageManifest, IndexEntry, ManifestList, ManifestType, Platform,
};
pub use reference::{ImageReference, TagPolicy};
