#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use xregistry_bridge::server;

#[derive(Parser)]
#[command(
    name = "xregistry-bridge",
    about = "Federating read-only reverse proxy for xRegistry services"
)]
struct Cli {
    /// Path to the downstreams config file. Falls back to
    /// $BRIDGE_CONFIG_FILE, then `downstreams.json`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address. Defaults to 0.0.0.0:$PORT (port 8080).
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| std::env::var("BRIDGE_CONFIG_FILE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("downstreams.json"));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path,
        listen: cli.listen,
    }))
}
