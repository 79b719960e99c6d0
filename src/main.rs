use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use split_dns::{Config, Mode};

#[derive(Debug, Parser)]
#[command(name = "split-dns", version, about = "Split-horizon DNS proxy over a mutual-TLS tunnel")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "./conf.json", env = "SPLIT_DNS_CONF")]
    conf: PathBuf,

    /// Override the configured mode (client or server)
    #[arg(long)]
    mode: Option<Mode>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load(&args.conf) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };
    if let Some(mode) = args.mode {
        config.mode = mode;
        if let Err(e) = config.validate() {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = split_dns::logging::init(&config) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    info!("Starting split-dns in {:?} mode", config.mode);

    if let Err(e) = split_dns::run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
