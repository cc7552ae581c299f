//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Error type for credential loading.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("client verifier: {0}")]
    Verifier(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Build the server-side acceptor from PEM files.
///
/// With `ca_path` set, clients must present a certificate chaining to one of
/// the listed authorities.
pub fn load_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let server_config = match &config.ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };

    tracing::info!(
        cert_path = %config.cert_path,
        client_auth = config.ca_path.is_some(),
        "TLS credentials loaded"
    );
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn self_signed(dir: &tempfile::TempDir) -> TlsConfig {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        TlsConfig {
            cert_path: write(dir, "cert.pem", &certified.cert.pem()),
            key_path: write(dir, "key.pem", &certified.key_pair.serialize_pem()),
            ca_path: None,
        }
    }

    #[test]
    fn loads_self_signed_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = self_signed(&dir);
        assert!(load_tls_acceptor(&config).is_ok());
    }

    #[test]
    fn client_verification_uses_ca_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = self_signed(&dir);
        config.ca_path = Some(config.cert_path.clone());
        assert!(load_tls_acceptor(&config).is_ok());
    }

    #[test]
    fn missing_file_names_the_path() {
        let config = TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
            ca_path: None,
        };
        let Err(err) = load_tls_acceptor(&config) else {
            panic!("loaded credentials from a missing file");
        };
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = self_signed(&dir);
        config.key_path = config.cert_path.clone();
        assert!(matches!(
            load_tls_acceptor(&config),
            Err(TlsError::NoPrivateKey(_))
        ));
    }
}
