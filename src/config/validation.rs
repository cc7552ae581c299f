//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sizes, thresholds)
//! - Detect conflicting or unusable listener settings
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DaemonConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::codec::HEADER_LEN;
use crate::config::schema::DaemonConfig;

/// One rejected setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every semantic rule and report all violations.
pub fn validate_config(config: &DaemonConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let listener = &config.listener;

    if listener.port.is_none() && listener.port_tls.is_none() {
        errors.push(ValidationError::new("listener.port", "at least one of port / port_tls must be set"));
    }
    if listener.port.is_some() && listener.port == listener.port_tls {
        errors.push(ValidationError::new("listener.port_tls", "must differ from listener.port"));
    }
    if listener.port_tls.is_some() && config.tls.is_none() {
        errors.push(ValidationError::new("tls", "a [tls] section is required when port_tls is set"));
    }
    if listener.no_tcp {
        errors.push(ValidationError::new("listener.no_tcp", "TCP is the only available transport"));
    }
    if !listener.no_sctp {
        errors.push(ValidationError::new("listener.no_sctp", "SCTP is not supported by this build"));
    }
    if listener.no_ip4 && listener.no_ip6 {
        errors.push(ValidationError::new("listener.no_ip4", "IPv4 and IPv6 cannot both be disabled"));
    }
    for entry in &listener.listen_on {
        if entry.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "listener.listen_on",
                format!("{entry:?} is not an IP address"),
            ));
        }
    }
    if listener.max_message_size < HEADER_LEN {
        errors.push(ValidationError::new(
            "listener.max_message_size",
            format!("must be at least {HEADER_LEN}"),
        ));
    }

    if config.timeouts.incoming_connection_secs == 0 {
        errors.push(ValidationError::new("timeouts.incoming_connection_secs", "must be greater than 0"));
    }

    let queues = &config.queues;
    let (high, low) = (queues.peer_events_high_watermark, queues.peer_events_low_watermark);
    if (high, low) != (0, 0) && high <= low {
        errors.push(ValidationError::new(
            "queues.peer_events_high_watermark",
            format!("must be greater than the low watermark ({low})"),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(validate_config(&DaemonConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_violation() {
        let mut config = DaemonConfig::default();
        config.listener.port = None;
        config.listener.no_sctp = false;
        config.listener.listen_on = vec!["not-an-ip".to_string()];
        config.timeouts.incoming_connection_secs = 0;
        config.queues.peer_events_high_watermark = 5;
        config.queues.peer_events_low_watermark = 5;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "listener.port",
                "listener.no_sctp",
                "listener.listen_on",
                "timeouts.incoming_connection_secs",
                "queues.peer_events_high_watermark",
            ]
        );
    }

    #[test]
    fn tls_port_needs_credentials_and_its_own_port() {
        let mut config = DaemonConfig::default();
        config.listener.port_tls = Some(3868);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);

        config.listener.port_tls = Some(3869);
        config.tls = Some(TlsConfig {
            cert_path: "cert.pem".to_string(),
            key_path: "key.pem".to_string(),
            ca_path: None,
        });
        assert!(validate_config(&config).is_ok());
    }
}
