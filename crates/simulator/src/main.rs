use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use simulator::config::{load_config_file, Cli, RuntimeConfig};
use simulator::simulate;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load config file if specified.
    let config_file = match load_config_file(cli.config.as_ref()) {
        Ok(cf) => cf,
        Err(e) => {
            eprintln!("error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Merge CLI and file config.
    let runtime_config = match RuntimeConfig::from_cli_and_file(&cli, config_file) {
        Ok(rc) => rc,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging (after merge so config file log_level is respected).
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&runtime_config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping simulation");
                cancel.cancel();
            }
        });
    }

    match simulate(runtime_config, cancel).await {
        Ok(report) => {
            print!("{report}");
            if report.honest_banned() > 0 {
                std::process::exit(2);
            }
        }
        Err(e) => {
            eprintln!("simulation error: {}", e);
            std::process::exit(1);
        }
    }
}
