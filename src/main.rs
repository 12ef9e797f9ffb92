use std::path::PathBuf;

use clap::Parser;
use n0_snafu::{Result, ResultExt};
use replicants::{config::Config, server::run_with_config_until_ctrl_c};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Run with the development config: in-memory store on port 3450
    #[clap(long, conflicts_with = "config")]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    let config = if let Some(path) = args.config {
        debug!("loading config from {:?}", path);
        Config::load(path).await.e()?
    } else if args.dev {
        debug!("using dev config");
        Config::dev()
    } else {
        debug!("using default config");
        Config::default()
    };

    run_with_config_until_ctrl_c(config).await
}
