//! `warcprox-rs`: CLI entrypoint (§6).

use clap::Parser;
use tracing_subscriber::EnvFilter;
use warc_archiver::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    cli::run(cli).await
}
