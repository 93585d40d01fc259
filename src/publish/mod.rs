//! Publishing single-architecture images through the container daemon

pub mod daemon;
pub mod progress;
pub mod publisher;

pub use daemon::{DaemonClient, EngineClient, ProgressStream};
pub use progress::{DigestMatcher, NdjsonDecoder, PushProgressEvent};
pub use publisher::ImagePublisher;
