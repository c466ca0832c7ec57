//! relaymq – broker daemon.
//
//  $ relaymq --config conf/config_main.toml
//  $ RELAYMQ_CONFIG=/etc/relaymq.yaml relaymq
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use relaymq::broker::RejectSessions;
use relaymq::config::{Config, DEFAULT_CONFIG_PATH};
use relaymq::logging::init_logging;
use relaymq::{diagnostics, run};

#[derive(Debug, Parser)]
#[command(name = "relaymq", version, about = "RelayMQ broker daemon")]
struct Cli {
    /// Path to config TOML or YAML (env RELAYMQ_CONFIG overrides)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config: Config = match Config::load(Some(cli.config.as_str())) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[FATAL] Couldn't read config file: {e}");
            process::exit(1);
        }
    };

    init_logging(&config.log);

    info!("Starting application");
    info!(
        cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        "Allocated cores"
    );

    if config.diagnostics.enable {
        diagnostics::spawn(config.diagnostics.bind_addr.clone());
    }

    match run(config, Arc::new(RejectSessions)).await {
        Ok(_report) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(stage = %e.stage, "startup aborted");
            process::exit(1);
        }
        Err(e) => {
            error!(stage = %e.stage, "Couldn't start listener");
            Err(e.into())
        }
    }
}
