//! SHA256 digest utilities for content-addressed registry objects
//!
//! Manifests and blobs fetched from a registry are verified against the digest
//! they were requested by; the manifest list we publish is addressed by the
//! digest of the exact bytes uploaded.

use crate::error::{PipelineError, Result};
use sha2::Digest;

/// Utilities for working with SHA256 digests in Docker context
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Compute full Docker digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, lowercase hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    /// Validate full Docker digest format (sha256:xxxxx)
    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix("sha256:")
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Check that `data` hashes to `expected`
    pub fn verify(data: &[u8], expected: &str, what: &str) -> Result<()> {
        let actual = Self::compute_docker_digest(data);
        if actual != expected {
            return Err(PipelineError::InvalidManifest(format!(
                "{} digest mismatch: expected {}, got {}",
                what, expected, actual
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_empty_digest() {
        assert_eq!(
            DigestUtils::compute_docker_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn validates_digest_format() {
        let digest = DigestUtils::compute_docker_digest(b"manifest");
        assert!(DigestUtils::is_valid_docker_digest(&digest));
        assert!(!DigestUtils::is_valid_docker_digest("sha256:abc"));
        assert!(!DigestUtils::is_valid_docker_digest(&digest.to_uppercase()));
        assert!(!DigestUtils::is_valid_docker_digest(&digest[7..]));
    }

    #[test]
    fn verify_detects_mismatch() {
        let digest = DigestUtils::compute_docker_digest(b"config");
        assert!(DigestUtils::verify(b"config", &digest, "config").is_ok());
        assert!(DigestUtils::verify(b"tampered", &digest, "config").is_err());
    }
}
