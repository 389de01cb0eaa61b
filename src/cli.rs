//! Shared CLI helpers and small reusable Clap fragments

use clap::Parser;
use std::path::PathBuf;

/// Common daemon options used by depotd
#[derive(Clone, Debug, Parser)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:9131")]
    pub bind: String,

    /// Root directory to serve (created if missing)
    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}
