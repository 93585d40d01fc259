//! Registry module for Docker registry interactions
//!
//! Credential resolution, token negotiation and the Registry HTTP API v2
//! client used to probe images and write manifest lists.

pub mod auth;
pub mod client;
pub mod keychain;
pub mod operations;
pub mod probe;
#[cfg(test)]
pub(crate) mod test_server;

pub use auth::{Auth, Authorization};
pub use client::{Registry, RegistryClient, RegistryClientBuilder, RemoteImage};
pub use keychain::{AuthResolver, Credential, DockerConfigKeychain, GitHubKeychain, Keychain};
pub use probe::{Existence, ExistenceProbe};
