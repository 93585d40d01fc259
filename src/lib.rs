//! update-builder library
//!
//! Builds single-architecture builder images for each variant, pushes them
//! through the container daemon and publishes them as one Docker manifest
//! list under a versioned tag and `latest`.

pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod image;
pub mod index;
pub mod logging;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod release;

pub use error::{PipelineError, Result};
pub use logging::Logger;
