//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the daemon.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listening endpoints.
    pub listener: ListenerConfig,

    /// Credentials for TLS listeners.
    pub tls: Option<TlsConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Inter-task event queues.
    pub queues: QueueConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port for clear connections (TLS may be negotiated later). `None` disables.
    pub port: Option<u16>,

    /// Port for connections that start with a TLS handshake. `None` disables.
    pub port_tls: Option<u16>,

    /// Local addresses to listen on. Empty means the wildcard addresses.
    pub listen_on: Vec<String>,

    /// Disable IPv4 endpoints.
    pub no_ip4: bool,

    /// Disable IPv6 endpoints.
    pub no_ip6: bool,

    /// Disable TCP listeners.
    pub no_tcp: bool,

    /// Disable SCTP listeners.
    pub no_sctp: bool,

    /// Largest accepted message, header included.
    pub max_message_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: Some(3868),
            port_tls: None,
            listen_on: Vec::new(),
            no_ip4: false,
            no_ip6: false,
            no_tcp: false,
            no_sctp: true,
            max_message_size: 65_536,
        }
    }
}

/// TLS configuration for secure listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Trusted client CAs (PEM). When set, clients must present a certificate.
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time from accept until a valid CER must have arrived, in seconds.
    pub incoming_connection_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            incoming_connection_secs: 20,
        }
    }
}

/// Queue sizing.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the peer event queue (0 = unbounded).
    pub peer_events_capacity: usize,

    /// Backlog alarm thresholds (both 0 = no alarm).
    pub peer_events_high_watermark: usize,
    pub peer_events_low_watermark: usize,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter (e.g., "info", "diameter_acceptor=debug").
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
