//! CLI module for minerd - command-line interface and subcommands.
//!
//! Provides the clap definitions, the task file format and the snapshot
//! printer used by `minerd run`.

pub mod commands;
pub mod render;
pub mod tasks;

pub use commands::Cli;
