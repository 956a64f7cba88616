//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::model::TrackType;

/// Simulate command arguments.
#[derive(Debug, Args)]
pub struct SimulateCommand {
    /// School to simulate
    #[arg(short, long, default_value = "S1")]
    pub school: String,

    /// Viewer user whose transport record picks the route
    #[arg(short, long, default_value = "U1")]
    pub user: String,

    /// Driver staff id
    #[arg(short, long, default_value = "D1")]
    pub driver: String,

    /// Leg to drive and watch
    #[arg(short, long, value_enum, default_value = "pickup")]
    pub track_type: TrackTypeArg,

    /// Number of positions to publish along the route
    #[arg(long, default_value = "10")]
    pub steps: usize,

    /// Time between positions in milliseconds (at least the minimum update interval)
    #[arg(long)]
    pub step_ms: Option<u64>,

    /// Relay stores positions but does not push them; viewers rely on polling
    #[arg(long)]
    pub drop_pushes: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// School of the viewer
    #[arg(short, long, default_value = "S1")]
    pub school: String,

    /// Viewer user whose transport record picks the route
    #[arg(short, long, default_value = "U1")]
    pub user: String,

    /// Leg to watch
    #[arg(short, long, value_enum, default_value = "pickup")]
    pub track_type: TrackTypeArg,

    /// Relay WebSocket URL (overrides connection.relay_url)
    #[arg(long, value_name = "URL")]
    pub relay: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub seconds: Option<u64>,

    /// Print each view as a JSON line
    #[arg(short, long)]
    pub json: bool,
}

/// Route commands.
#[derive(Debug, Subcommand)]
pub enum RouteCommand {
    /// Resolve a route and print its stops
    Show {
        /// Route id
        route_id: String,

        /// School the route belongs to
        #[arg(short, long)]
        school: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Track type argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TrackTypeArg {
    /// Home to school
    Pickup,
    /// School to home
    Drop,
}

impl From<TrackTypeArg> for TrackType {
    fn from(arg: TrackTypeArg) -> Self {
        match arg {
            TrackTypeArg::Pickup => Self::Pickup,
            TrackTypeArg::Drop => Self::Drop,
        }
    }
}
