//! Process-wide set of listeners.
//!
//! # Responsibilities
//! - Expand the listener configuration into concrete endpoints
//! - Bind and start them in order; undo everything on the first failure
//! - Stop them all concurrently at shutdown

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use super::connection::{Protocol, Security};
use super::handshake::AcceptContext;
use super::listener::{ListenerError, ListenerService, ListenerSnapshot, ListenerStatus, TcpAcceptor};
use crate::config::ListenerConfig;
use crate::lifecycle::ShutdownReason;

/// One endpoint to listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSpec {
    pub addr: SocketAddr,
    pub protocol: Protocol,
    pub security: Security,
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.security {
            Security::TlsImmediate => write!(f, "{}/TLS {}", self.protocol, self.addr),
            Security::Clear => write!(f, "{} {}", self.protocol, self.addr),
        }
    }
}

/// Expand `config` into endpoints.
///
/// Explicit `listen_on` addresses are used as given (filtered by family);
/// otherwise the IPv6 wildcard comes before the IPv4 wildcard so the latter
/// can be recognised as covered by a dual-stack socket.
pub fn plan_listeners(config: &ListenerConfig) -> Vec<ListenerSpec> {
    let family_enabled = |ip: &IpAddr| match ip {
        IpAddr::V4(_) => !config.no_ip4,
        IpAddr::V6(_) => !config.no_ip6,
    };

    let addrs: Vec<IpAddr> = if config.listen_on.is_empty() {
        vec![
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        ]
    } else {
        config
            .listen_on
            .iter()
            .filter_map(|entry| entry.parse::<IpAddr>().ok())
            .collect()
    };
    let addrs: Vec<IpAddr> = addrs.into_iter().filter(family_enabled).collect();

    let mut protocols = Vec::new();
    if !config.no_tcp {
        protocols.push(Protocol::Tcp);
    }
    if !config.no_sctp {
        protocols.push(Protocol::Sctp);
    }

    let ports = [
        (config.port, Security::Clear),
        (config.port_tls, Security::TlsImmediate),
    ];

    let mut specs = Vec::new();
    for protocol in protocols {
        for (port, security) in ports {
            let Some(port) = port else { continue };
            for ip in &addrs {
                specs.push(ListenerSpec {
                    addr: SocketAddr::new(*ip, port),
                    protocol,
                    security,
                });
            }
        }
    }
    specs
}

/// All listeners of the daemon.
pub struct ListenerRegistry {
    listeners: Vec<Arc<ListenerService>>,
}

impl ListenerRegistry {
    /// Bind and start every planned listener.
    ///
    /// On failure the listeners already started are stopped, the daemon
    /// shutdown is raised and the error returned.
    pub async fn start(
        config: &ListenerConfig,
        tls: Option<TlsAcceptor>,
        ctx: AcceptContext,
    ) -> Result<Self, ListenerError> {
        let mut registry = Self {
            listeners: Vec::new(),
        };

        for spec in plan_listeners(config) {
            match registry.start_one(spec, config, tls.as_ref(), &ctx).await {
                Ok(Some(service)) => registry.listeners.push(service),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        listener = %spec,
                        status = ?ListenerStatus::Error,
                        error = %e,
                        "Listener failed to start"
                    );
                    registry.stop().await;
                    ctx.shutdown.trigger(ShutdownReason::ListenerFailed {
                        listener: spec.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        tracing::info!(count = registry.listeners.len(), "Listeners started");
        Ok(registry)
    }

    async fn start_one(
        &self,
        spec: ListenerSpec,
        config: &ListenerConfig,
        tls: Option<&TlsAcceptor>,
        ctx: &AcceptContext,
    ) -> Result<Option<Arc<ListenerService>>, ListenerError> {
        if spec.protocol == Protocol::Sctp {
            return Err(ListenerError::Unsupported {
                protocol: spec.protocol,
                addr: spec.addr,
            });
        }
        let tls = match spec.security {
            Security::TlsImmediate => Some(
                tls.cloned()
                    .ok_or(ListenerError::TlsNotConfigured(spec.addr))?,
            ),
            Security::Clear => None,
        };

        let acceptor = match TcpAcceptor::bind(spec.addr, tls, config.max_message_size).await {
            Ok(acceptor) => acceptor,
            Err(e) if e.is_addr_in_use() && self.covered_by_dual_stack(&spec) => {
                tracing::info!(listener = %spec, "Covered by the IPv6 wildcard listener, skipped");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let service = ListenerService::new(Box::new(acceptor), spec.security, ctx.clone())?;
        service.start()?;
        Ok(Some(service))
    }

    fn covered_by_dual_stack(&self, spec: &ListenerSpec) -> bool {
        spec.addr.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            && self.listeners.iter().any(|l| {
                l.local_addr().ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                    && l.local_addr().port() == spec.addr.port()
                    && l.protocol() == spec.protocol
            })
    }

    /// Stop every listener concurrently. Idempotent.
    pub async fn stop(&self) {
        let mut stopping = JoinSet::new();
        for listener in &self.listeners {
            let listener = Arc::clone(listener);
            stopping.spawn(async move { listener.stop().await });
        }
        while let Some(result) = stopping.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Listener stop task failed");
            }
        }
    }

    pub fn listeners(&self) -> &[Arc<ListenerService>] {
        &self.listeners
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    pub fn snapshot(&self) -> Vec<ListenerSnapshot> {
        self.listeners.iter().map(|l| l.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ListenerConfig {
        ListenerConfig::default()
    }

    #[test]
    fn default_plan_is_clear_tcp_on_both_wildcards() {
        let specs = plan_listeners(&config());
        let rendered: Vec<String> = specs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["TCP [::]:3868", "TCP 0.0.0.0:3868"]);
    }

    #[test]
    fn tls_port_and_family_filters() {
        let mut config = config();
        config.port_tls = Some(3869);
        config.no_ip6 = true;
        let specs = plan_listeners(&config);
        assert_eq!(specs.len(), 2);
        assert!(specs.iter().all(|s| s.addr.is_ipv4()));
        assert_eq!(specs[1].security, Security::TlsImmediate);
        assert_eq!(specs[1].addr.port(), 3869);
    }

    #[test]
    fn explicit_endpoints_replace_wildcards() {
        let mut config = config();
        config.listen_on = vec!["127.0.0.1".to_string(), "::1".to_string()];
        config.no_ip4 = true;
        let specs = plan_listeners(&config);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].addr, "[::1]:3868".parse().unwrap());
    }

    #[test]
    fn sctp_is_planned_only_when_enabled() {
        let mut config = config();
        config.no_ip6 = true;
        assert!(plan_listeners(&config).iter().all(|s| s.protocol == Protocol::Tcp));
        config.no_sctp = false;
        assert!(plan_listeners(&config).iter().any(|s| s.protocol == Protocol::Sctp));
    }
}
