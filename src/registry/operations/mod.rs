//! Registry operations - endpoint-level building blocks used by the client

pub mod blob_operations;
pub mod manifest_operations;

pub use blob_operations::BlobOperations;
pub use manifest_operations::{FetchedManifest, ManifestOperations};
