//! Command-line argument parsing

use crate::config::{Environment, PipelineConfig};
use crate::error::Result;
use crate::logging::Logger;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "update-builder")]
#[command(about = "Build, push and publish multi-architecture builder images as one manifest list")]
#[command(version)]
pub struct Args {
    /// Pipeline configuration file
    #[arg(
        long = "config",
        short = 'c',
        help = "JSON pipeline configuration; built-in defaults are used when omitted"
    )]
    pub config: Option<PathBuf>,

    /// Variants to update, in order
    #[arg(
        long = "variant",
        help = "Builder variant to update (repeatable); overrides the configuration and UPDATE_BUILDER_VARIANTS"
    )]
    pub variants: Vec<String>,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(
        long = "quiet",
        short = 'q',
        conflicts_with = "verbose",
        help = "Only print group markers, warnings and errors"
    )]
    pub quiet: bool,
}

impl Args {
    pub fn logger(&self) -> Logger {
        if self.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(self.verbose)
        }
    }

    /// Configuration file, then environment, then command line
    pub fn load_config(&self, env: &Environment) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?.apply_env(env);
        if !self.variants.is_empty() {
            config.variants = self.variants.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
