//! Command-line interface for bustrack.
//!
//! This module provides the CLI structure and command handlers for the
//! `bustrack` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, RouteCommand, SimulateCommand, TrackTypeArg, WatchCommand};

/// bustrack - Real-time school bus location tracking
///
/// Drives a bus along a route and watches it from a parent's device, all
/// in-process, follows a bus through a relay, or inspects routes and
/// configuration.
#[derive(Debug, Parser)]
#[command(name = "bustrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a driver and a viewer against an in-process relay
    Simulate(SimulateCommand),

    /// Follow a bus through an external relay
    Watch(WatchCommand),

    /// Inspect routes
    #[command(subcommand)]
    Route(RouteCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        crate::logging::Verbosity::from_flags(self.quiet, self.verbose)
    }
}
