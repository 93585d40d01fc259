//! Error types and handlers for the builder publishing pipeline

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed image reference, never retried
    #[error("invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Credential resolution failed in one of the keychains
    #[error("cannot resolve credentials for {registry} ({keychain}): {message}")]
    Auth {
        registry: String,
        keychain: String,
        message: String,
    },

    /// Registry or network fault; `status` is set when the registry answered
    #[error("{operation} {reference} failed{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Transport {
        operation: String,
        reference: String,
        status: Option<u16>,
        message: String,
    },

    /// The daemon push did not produce a usable digest
    #[error("cannot push {reference}: {message}")]
    Push { reference: String, message: String },

    /// Descriptor or config of a pushed image could not be read
    #[error("cannot describe image {reference}: {source}")]
    Descriptor {
        reference: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// Manifest list upload failed
    #[error("cannot write image index {reference}: {source}")]
    Write {
        reference: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("release lookup failed for {repository}: {message}")]
    Release { repository: String, message: String },

    #[error("build failed for {image}: {message}")]
    Build { image: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    /// Wraps an error with the stage that was being attempted
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn transport(
        operation: impl Into<String>,
        reference: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        PipelineError::Transport {
            operation: operation.into(),
            reference: reference.into(),
            status,
            message: message.into(),
        }
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// HTTP status of a transport failure, looking through context wrappers
    pub fn status(&self) -> Option<u16> {
        match self {
            PipelineError::Transport { status, .. } => *status,
            PipelineError::Context { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// The registry rejected the authorization the request carried
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Cancelled => true,
            PipelineError::Context { source, .. }
            | PipelineError::Descriptor { source, .. }
            | PipelineError::Write { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Innermost error, skipping context and descriptor/write wrappers
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::Context { source, .. }
            | PipelineError::Descriptor { source, .. }
            | PipelineError::Write { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<url::ParseError> for PipelineError {
    fn from(err: url::ParseError) -> Self {
        PipelineError::Config(format!("invalid URL: {}", err))
    }
}

/// Wraps the error of a fallible expression with the stage being attempted
#[macro_export]
macro_rules! with_context {
    ($result:expr, $($context:tt)+) => {
        $result.map_err(|e: $crate::error::PipelineError| e.with_context(format!($($context)+)))
    };
}
