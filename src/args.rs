//! swarm-collector CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the
//! swarm-collector application.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// swarm-collector CLI arguments.
#[derive(Parser, Debug, Clone, Eq, PartialEq, Hash)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the JSON configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Listen address for the correlator UDP data
    #[clap(long, default_value = "0.0.0.0:4100")]
    pub listen: SocketAddr,
    /// Listen address for the HTTP server
    #[clap(long, default_value = "0.0.0.0:8000")]
    pub http: SocketAddr,
    /// Check that the node buffers contain the test ramp
    #[clap(long)]
    pub ramp_check: bool,
}
