//! storyreel command-line interface built on clap.
//!
//! Defines [`Cli`] with its [`Command`]s (serve, run, status, steps) and the
//! global flags (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// storyreel: step-sequenced media generation jobs.
#[derive(Debug, Parser)]
#[command(name = "storyreel", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: ./storyreel.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the HTTP API and process queued steps.
    Serve {
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one job end to end in this process.
    Run {
        /// Story prompt.
        prompt: Option<String>,

        /// Job id (generated when omitted).
        #[arg(long)]
        job_id: Option<String>,

        /// Number of images to generate.
        #[arg(long)]
        images: Option<u32>,

        /// Path to a JSON file holding a full or partial job config.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Keep job records and artifacts in memory instead of on disk.
        #[arg(long, default_value_t = false)]
        in_memory: bool,
    },

    /// Show the stored state of a job.
    Status {
        /// Job id.
        job_id: String,
    },

    /// List the pipeline steps in execution order.
    Steps,
}
