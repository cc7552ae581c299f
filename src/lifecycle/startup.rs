//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order
//! - Bind listeners and begin accepting connections
//! - Tear everything down in reverse order once shutdown is raised
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (connections only when the peer queue exists)
//! - Listeners stop first, so no hand-off races the queue teardown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::shutdown::{Shutdown, ShutdownReason};
use super::signals::spawn_signal_handler;
use crate::codec::BaseProtocolCodec;
use crate::config::DaemonConfig;
use crate::net::listener::ListenerError;
use crate::net::tls::{load_tls_acceptor, TlsError};
use crate::net::{AcceptContext, ListenerRegistry};
use crate::observability::metrics::init_metrics;
use crate::peer::{BacklogAlarm, PeerEvent, QueuedPeerManager};
use crate::queue::{EventQueue, QueueError};

/// Name of the acceptor → peer layer queue in logs and metrics.
pub const PEER_EVENTS_QUEUE: &str = "peer_events";

/// Error type for daemon startup and exit.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("TLS credentials: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("event queue: {0}")]
    Queue(#[from] QueueError),

    #[error("metrics exporter: {0}")]
    Metrics(String),

    #[error("daemon stopped: {0}")]
    Fatal(ShutdownReason),
}

/// A running daemon: listeners plus the peer event consumer.
pub struct Daemon {
    shutdown: Shutdown,
    registry: ListenerRegistry,
    events: EventQueue<PeerEvent>,
    drain_token: CancellationToken,
    drain: JoinHandle<usize>,
}

impl Daemon {
    /// Build the peer queue, load credentials and start every listener.
    pub async fn start(config: &DaemonConfig, shutdown: Shutdown) -> Result<Self, StartupError> {
        let queues = &config.queues;
        let events = EventQueue::new(queues.peer_events_capacity);
        if queues.peer_events_high_watermark > 0 {
            events.set_thresholds(
                queues.peer_events_high_watermark,
                queues.peer_events_low_watermark,
                BacklogAlarm::new(PEER_EVENTS_QUEUE),
            )?;
        }

        let tls = match &config.tls {
            Some(tls) => Some(load_tls_acceptor(tls)?),
            None => None,
        };

        let ctx = AcceptContext::new(
            Arc::new(BaseProtocolCodec::default()),
            Arc::new(QueuedPeerManager::new(events.clone())),
            shutdown.clone(),
        )
        .with_incoming_timeout(Duration::from_secs(config.timeouts.incoming_connection_secs));

        let registry = match ListenerRegistry::start(&config.listener, tls, ctx).await {
            Ok(registry) => registry,
            Err(e) => {
                events.clear_thresholds();
                let _ = events.destroy().await;
                return Err(e.into());
            }
        };

        let drain_token = shutdown.child_token();
        let drain = tokio::spawn(drain_peer_events(events.clone(), drain_token.clone()));

        Ok(Self {
            shutdown,
            registry,
            events,
            drain_token,
            drain,
        })
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.registry.local_addrs()
    }

    /// Wait for the shutdown event, then stop everything.
    ///
    /// Returns an error when the daemon stopped because something failed.
    pub async fn wait(self) -> Result<(), StartupError> {
        self.shutdown.cancelled().await;

        self.registry.stop().await;

        self.drain_token.cancel();
        match self.drain.await {
            Ok(handled) => tracing::debug!(handled, "Peer event consumer stopped"),
            Err(e) => tracing::warn!(error = %e, "Peer event consumer did not exit cleanly"),
        }

        self.events.clear_thresholds();
        loop {
            while let Ok(event) = self.events.try_pop() {
                event.discard().await;
            }
            match self.events.destroy().await {
                // A slow hand-off landed after the drain.
                Err(QueueError::NotEmpty(_)) => continue,
                other => other?,
            }
            break;
        }

        match self.shutdown.reason() {
            Some(reason) if reason.is_fatal() => Err(StartupError::Fatal(reason)),
            _ => Ok(()),
        }
    }
}

/// Consume peer events until cancelled or the queue is destroyed.
///
/// The peer state machine is not part of this daemon: every accepted peer is
/// logged and its connection released.
async fn drain_peer_events(events: EventQueue<PeerEvent>, token: CancellationToken) -> usize {
    let mut handled = 0;
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.pop() => event,
        };
        let Ok(PeerEvent::IncomingCer {
            message,
            mut connection,
        }) = event
        else {
            break;
        };
        handled += 1;
        tracing::info!(
            origin_host = message.origin_host().unwrap_or("-"),
            origin_realm = message.origin_realm().unwrap_or("-"),
            peer = %connection.description(),
            "Peer accepted, releasing connection"
        );
        connection.close().await;
    }
    handled
}

/// Run the daemon until a signal or a fatal error.
pub async fn run_daemon(config: DaemonConfig) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|e| StartupError::Metrics(format!("{}", e)))?;
        init_metrics(addr).map_err(|e| StartupError::Metrics(e.to_string()))?;
    }

    let shutdown = Shutdown::new();
    let signals = spawn_signal_handler(shutdown.clone());

    let result = match Daemon::start(&config, shutdown.clone()).await {
        Ok(daemon) => {
            tracing::info!(addresses = ?daemon.local_addrs(), "diameterd ready");
            daemon.wait().await
        }
        Err(e) => Err(e),
    };

    shutdown.trigger(ShutdownReason::Requested);
    let _ = signals.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn loopback_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.listener.port = Some(0);
        config.listener.listen_on = vec!["127.0.0.1".to_string()];
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepted_peer_is_drained_and_released() {
        let shutdown = Shutdown::new();
        let daemon = Daemon::start(&loopback_config(), shutdown.clone()).await.unwrap();
        let addr = daemon.local_addrs()[0];

        let mut client = TcpStream::connect(addr).await.unwrap();
        let cer = MessageBuilder::capabilities_exchange_request(
            "client.example",
            "example",
            "127.0.0.1".parse().unwrap(),
        )
        .build();
        client.write_all(&cer).await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0, "released connection reads EOF");

        shutdown.trigger(ShutdownReason::Requested);
        daemon.wait().await.unwrap();
    }

    #[tokio::test]
    async fn fatal_reason_fails_the_daemon() {
        let shutdown = Shutdown::new();
        let daemon = Daemon::start(&loopback_config(), shutdown.clone()).await.unwrap();
        shutdown.trigger(ShutdownReason::Internal {
            what: "test".to_string(),
        });
        assert!(matches!(daemon.wait().await, Err(StartupError::Fatal(_))));
    }

    #[tokio::test]
    async fn occupied_port_aborts_startup() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = loopback_config();
        config.listener.port = Some(taken.local_addr().unwrap().port());

        let shutdown = Shutdown::new();
        let err = match Daemon::start(&config, shutdown.clone()).await {
            Ok(_) => panic!("started on an occupied port"),
            Err(e) => e,
        };
        let StartupError::Listener(listener_err) = &err else {
            panic!("unexpected startup error: {err}");
        };
        assert!(listener_err.is_addr_in_use());
        assert!(err.to_string().contains(&taken.local_addr().unwrap().to_string()));
        assert!(matches!(
            shutdown.reason(),
            Some(ShutdownReason::ListenerFailed { .. })
        ));
    }
}
