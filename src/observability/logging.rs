//! Structured logging.
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level so operators can raise
//!   verbosity without editing the config file
//! - Initialisation tolerates an already installed subscriber (tests)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `level` is an `EnvFilter` directive such
/// as `info` or `diameter_acceptor=debug`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
