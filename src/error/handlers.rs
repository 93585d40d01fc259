//! Standardized classification of HTTP and network failures

use crate::error::PipelineError;
use reqwest::StatusCode;

/// Standard error handler for registry HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Turn a non-success registry response into a transport error.
    ///
    /// The status code is always preserved so callers can tell a missing
    /// manifest (404) apart from every other failure.
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
        reference: &str,
    ) -> PipelineError {
        let message = match status.as_u16() {
            401 => format!("unauthorized: {}", error_text),
            403 => format!("forbidden, insufficient permissions: {}", error_text),
            404 => format!("not found: {}", error_text),
            429 => format!("rate limited: {}", error_text),
            500 => format!("registry server error: {}", error_text),
            502 | 503 => format!("registry unavailable: {}", error_text),
            _ => error_text.to_string(),
        };

        PipelineError::transport(operation, reference, Some(status.as_u16()), message.trim())
    }

    /// Handle token endpoint failures.
    ///
    /// A rejected credential is a transport failure carrying the token
    /// endpoint's status; `Auth` is reserved for keychain resolution.
    pub fn handle_auth_error(status: StatusCode, error_text: &str, registry: &str) -> PipelineError {
        let message = match status.as_u16() {
            400 => "invalid token request parameters".to_string(),
            401 => "invalid credentials provided".to_string(),
            403 => "access denied, insufficient permissions".to_string(),
            404 => "authentication endpoint not found".to_string(),
            _ => format!("token request failed: {}", error_text.trim()),
        };

        PipelineError::transport("token request", registry, Some(status.as_u16()), message)
    }

    /// Handle failures while asking the daemon to start a push
    pub fn handle_daemon_error(status: StatusCode, error_text: &str, image: &str) -> PipelineError {
        let message = match status.as_u16() {
            404 => format!("no such image in the daemon: {}", error_text),
            500 => format!("daemon error: {}", error_text),
            _ => format!("daemon returned {}: {}", status, error_text),
        };

        PipelineError::Push {
            reference: image.to_string(),
            message: format!("cannot initialize image push: {}", message.trim()),
        }
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize a reqwest failure; the request never produced a status
    pub fn handle_network_error(error: &reqwest::Error, operation: &str, reference: &str) -> PipelineError {
        let message = if error.is_timeout() {
            format!("timeout: {}", error)
        } else if error.is_connect() {
            format!("connection error: {}", error)
        } else if error.to_string().contains("dns") {
            format!("DNS resolution error: {}", error)
        } else if error.to_string().contains("certificate") {
            format!("TLS certificate error: {}", error)
        } else {
            format!("network error: {}", error)
        };

        PipelineError::transport(operation, reference, error.status().map(|s| s.as_u16()), message)
    }
}
