//! Command line interface module
//!
//! Argument parsing and the runner that processes every configured builder
//! variant, printing CI group markers around each one.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::{RunSummary, Runner};
