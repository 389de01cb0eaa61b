use anyhow::{Context, Result};
use clap::Parser;

use depot::cli::DaemonOpts;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // All connection state lives on this one thread; the reactor multiplexes
    // every socket over it.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(depot::server::serve(&opts.bind, &opts.root))
}
