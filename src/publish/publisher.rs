//! Pushes locally built images through the daemon and recovers their digest

use crate::error::{PipelineError, Result};
use crate::image::ImageReference;
use crate::logging::Logger;
use crate::publish::daemon::{DaemonClient, ProgressStream};
use crate::publish::progress::{spawn_renderer, DigestMatcher, NdjsonDecoder};
use crate::registry::keychain::AuthResolver;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ImagePublisher {
    daemon: Arc<dyn DaemonClient>,
    auth: AuthResolver,
    output: Logger,
}

impl ImagePublisher {
    pub fn new(daemon: Arc<dyn DaemonClient>, auth: AuthResolver, output: Logger) -> Self {
        Self { daemon, auth, output }
    }

    /// Push a tagged local image and return the manifest digest the daemon reported
    pub async fn push(&self, reference: &ImageReference, cancel: &CancellationToken) -> Result<String> {
        let tag = reference.tag().ok_or_else(|| PipelineError::Push {
            reference: reference.to_string(),
            message: "a tag is required to push through the daemon".to_string(),
        })?;

        let credential = self.auth.resolve(reference).await?;
        let registry_auth = credential.daemon_auth_token()?;

        self.output.step(&format!("Pushing {}", reference));
        let name = reference.name();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            stream = self.daemon.push_image(&name, tag, &registry_auth) => stream?,
        };

        let digest = self.extract_digest(reference, stream, cancel).await?;
        self.output.success(&format!("Pushed {}@{}", reference.name(), digest));
        Ok(digest)
    }

    /// Scan the progress stream for the pushed digest while a renderer task
    /// displays the same bytes. The stream is read to its end even after the
    /// digest was found, and a transport failure at that point only ends the
    /// drain. The renderer is always joined before returning.
    pub async fn extract_digest(
        &self,
        reference: &ImageReference,
        mut stream: ProgressStream,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let renderer = spawn_renderer(rx, self.output.clone());

        let result = scan(reference, &mut stream, &tx, cancel, &self.output).await;

        drop(stream);
        drop(tx);
        if let Err(e) = renderer.await {
            self.output.debug(&format!("progress renderer failed: {}", e));
        }
        result
    }
}

async fn scan(
    reference: &ImageReference,
    stream: &mut ProgressStream,
    renderer: &UnboundedSender<Bytes>,
    cancel: &CancellationToken,
    output: &Logger,
) -> Result<String> {
    let push_error = |message: String| PipelineError::Push {
        reference: reference.to_string(),
        message,
    };

    let mut decoder = NdjsonDecoder::new();
    let mut digest: Option<String> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            // The push already succeeded; the rest of the stream is only discarded
            Err(e) if digest.is_some() => {
                output.debug(&format!("push progress ended early after the digest: {}", e));
                break;
            }
            Err(e) => return Err(push_error(format!("reading push progress: {}", e))),
        };
        // The renderer only goes away when its task panicked
        let _ = renderer.send(chunk.clone());

        if digest.is_some() {
            continue;
        }
        decoder.feed(&chunk);
        while let Some(event) = decoder
            .next_event()
            .map_err(|e| push_error(format!("decoding push progress: {}", e)))?
        {
            if event.is_error() {
                continue;
            }
            if let Some(found) = DigestMatcher::find(&event) {
                digest = Some(found);
                break;
            }
        }
    }

    match digest {
        Some(digest) => Ok(digest),
        None => {
            decoder
                .finish()
                .map_err(|e| push_error(format!("decoding push progress: {}", e)))?;
            Err(push_error("digest not found".to_string()))
        }
    }
}
