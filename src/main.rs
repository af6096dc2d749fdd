use anyhow::Result;
use clap::Parser;
use tracing::info;

use cloud_backup::cli::{self, Cli};
use cloud_backup::utils;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = utils::config::load_config()?;
    utils::logging::init_tracing(&config.log_level, config.log_json);

    info!("Starting cloud-backup v{}", env!("CARGO_PKG_VERSION"));
    cli::run(cli, config).await
}
