//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: run the scheduler against the simulated driver
//! - config: print the effective configuration
//! - tasks: validate a task file

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// minerd - admission-controlled mining session scheduler
#[derive(Parser, Debug)]
#[command(name = "minerd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Task file (YAML list of id/address entries)
        #[arg(short, long)]
        tasks: PathBuf,

        /// Seconds between printed snapshots
        #[arg(short, long, default_value_t = 10)]
        every: u64,

        /// Print snapshots as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as YAML
    Config,

    /// Validate a task file and print a summary
    Tasks {
        /// Task file to validate
        file: PathBuf,
    },
}
