//! ProofPulse service entry point.
//!
//! Exit codes: 0 after a graceful shutdown, 1 on fatal init failure or an
//! unhandled panic anywhere in the process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod app;
mod config;
mod health;
mod sinks;
mod workers;

use config::ServerConfig;
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);

    // Any escaped panic is non-operational: log it and exit 1 rather than
    // limping on with a dead task.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "Unhandled panic; terminating");
        default_hook(info);
        std::process::exit(1);
    }));

    match app::run(config).await {
        Ok(()) => {
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "Fatal startup or runtime error");
            std::process::exit(1);
        }
    }
}
