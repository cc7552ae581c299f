//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate the first signal into a shutdown event
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second signal is not special: shutdown is already bounded by the
//!   listener stop sequence

use tokio::task::JoinHandle;

use super::shutdown::{Shutdown, ShutdownReason};

/// Wait for the first termination signal and return its name.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

/// Trigger `shutdown` on the first signal. Exits quietly if the daemon shuts
/// down for another reason first.
pub fn spawn_signal_handler(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            received = wait_for_signal() => match received {
                Ok(name) => {
                    shutdown.trigger(ShutdownReason::Signal { name: name.to_string() });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cannot install signal handlers");
                    shutdown.trigger(ShutdownReason::Internal {
                        what: format!("signal handlers: {}", e),
                    });
                }
            },
        }
    })
}
