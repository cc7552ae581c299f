//! Diameter acceptor daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                     diameterd                        │
//!                     │                                                      │
//!   Peer connects     │  ┌──────────┐   ┌───────────┐   ┌─────────────────┐  │
//!   ──────────────────┼─▶│ listener │──▶│ handshake │──▶│ codec (parse +  │  │
//!                     │  │ (accept) │   │ TLS, CER, │   │ base grammar)   │  │
//!                     │  └──────────┘   │ deadline  │   └─────────────────┘  │
//!                     │                 └─────┬─────┘                        │
//!                     │                       │ CER + connection             │
//!                     │                       ▼                              │
//!                     │                ┌────────────┐    ┌───────────────┐   │
//!                     │                │ peer queue │───▶│ peer consumer │   │
//!                     │                │(EventQueue)│    └───────────────┘   │
//!                     │                └────────────┘                        │
//!                     │                                                      │
//!                     │   config · lifecycle (signals, shutdown) · metrics   │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use diameter_acceptor::config::{load_config, DaemonConfig};
use diameter_acceptor::lifecycle::run_daemon;
use diameter_acceptor::observability::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "diameterd", version, about = "Diameter connection acceptor")]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("diameterd: {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => DaemonConfig::default(),
    };

    if cli.check {
        println!("configuration OK");
        return ExitCode::SUCCESS;
    }

    init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "diameterd starting");
    tracing::info!(
        port = ?config.listener.port,
        port_tls = ?config.listener.port_tls,
        incoming_connection_secs = config.timeouts.incoming_connection_secs,
        "Configuration loaded"
    );

    match run_daemon(config).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "diameterd stopped with an error");
            ExitCode::FAILURE
        }
    }
}
