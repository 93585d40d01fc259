//! Push progress records, incremental decoding and rendering

use crate::error::{PipelineError, Result};
use crate::image::DigestUtils;
use crate::logging::Logger;
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Compatibility fallback for daemons that only report the digest in the
/// human-readable status line. The wording is not part of any API contract.
static STATUS_DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\sdigest: (sha256:[a-fA-F0-9]{64})\s").expect("status digest pattern is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Structured result the daemon attaches once a push completes
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushAux {
    #[serde(rename = "Tag", default)]
    pub tag: Option<String>,
    #[serde(rename = "Digest", default)]
    pub digest: Option<String>,
    #[serde(rename = "Size", default)]
    pub size: Option<u64>,
}

/// One record of the daemon's push progress stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushProgressEvent {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(rename = "progressDetail", default)]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "errorDetail", default)]
    pub error_detail: Option<ErrorDetail>,
    #[serde(default)]
    pub aux: Option<PushAux>,
}

impl PushProgressEvent {
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
            || self
                .error_detail
                .as_ref()
                .and_then(|d| d.message.as_deref())
                .is_some_and(|m| !m.is_empty())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .filter(|e| !e.is_empty())
            .or_else(|| self.error_detail.as_ref().and_then(|d| d.message.as_deref()))
    }
}

/// Decodes JSON records from a byte stream that may split them anywhere
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete record, `None` when more bytes are needed
    pub fn next_event(&mut self) -> Result<Option<PushProgressEvent>> {
        let (result, consumed) = {
            let mut records =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<PushProgressEvent>();
            match records.next() {
                Some(Ok(event)) => (Some(event), records.byte_offset()),
                Some(Err(e)) if e.is_eof() => (None, 0),
                Some(Err(e)) => return Err(PipelineError::Serialization(e)),
                None => (None, self.buffer.len()),
            }
        };
        self.buffer.drain(..consumed);
        Ok(result)
    }

    /// Fails when the stream ended inside a record
    pub fn finish(&self) -> Result<()> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(PipelineError::InvalidManifest(format!(
                "push progress ended inside a record ({} bytes left)",
                self.buffer.len()
            )))
        }
    }
}

/// Finds the pushed manifest digest in a progress record
pub struct DigestMatcher;

impl DigestMatcher {
    /// Structured `aux.Digest` first, the status line pattern as fallback
    pub fn find(event: &PushProgressEvent) -> Option<String> {
        if let Some(digest) = event.aux.as_ref().and_then(|a| a.digest.as_deref()) {
            let digest = digest.to_ascii_lowercase();
            if DigestUtils::is_valid_docker_digest(&digest) {
                return Some(digest);
            }
        }
        let status = event.status.as_deref()?;
        STATUS_DIGEST_RE
            .captures(status)
            .map(|c| c[1].to_ascii_lowercase())
    }
}

/// Render raw progress bytes until the sending side closes the channel.
/// Rendering never affects the push result.
pub fn spawn_renderer(mut rx: UnboundedReceiver<Bytes>, output: Logger) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = NdjsonDecoder::new();
        let mut decoding = true;
        while let Some(chunk) = rx.recv().await {
            if !decoding {
                continue;
            }
            decoder.feed(&chunk);
            loop {
                match decoder.next_event() {
                    Ok(Some(event)) => render(&output, &event),
                    Ok(None) => break,
                    Err(e) => {
                        output.debug(&format!("progress display stopped: {}", e));
                        decoding = false;
                        break;
                    }
                }
            }
        }
    })
}

fn render(output: &Logger, event: &PushProgressEvent) {
    if let Some(message) = event.error_message() {
        output.warning(&format!("daemon: {}", message));
        return;
    }
    if let Some(status) = event.status.as_deref() {
        output.push_progress(event.id.as_deref(), status, event.progress.as_deref());
    }
}
