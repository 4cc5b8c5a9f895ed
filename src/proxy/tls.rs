//! TLS configuration for both sides of an interception.
//!
//! - The tunnel endpoint terminates client TLS with a provider-issued
//!   certificate (proxy as server)
//! - The forwarder and upgrade bridge re-encrypt towards the origin
//!   (proxy as client), verifying against system roots
//!
//! # ALPN
//!
//! The terminating side only offers `http/1.1`. The decrypted stream is
//! served by an HTTP/1 connection; letting clients negotiate H2 would hand
//! it frames it cannot parse.

use super::error::ProxyError;
use crate::certs::CertificateRecord;
use rustls::crypto::aws_lc_rs;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

/// Create a TLS acceptor presenting `record`'s certificate.
pub fn create_tls_acceptor(record: &CertificateRecord) -> Result<TlsAcceptor, ProxyError> {
    let cert_chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut record.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(ProxyError::Tls("No certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut record.key_pem.as_bytes())
            .map_err(|e| ProxyError::Tls(format!("Failed to parse private key PEM: {}", e)))?
            .ok_or_else(|| ProxyError::Tls("No private key found in PEM".into()))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create a TLS connector trusting the system root certificates.
pub fn create_tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();

    for err in native_certs.errors {
        debug!("Warning loading native cert: {}", err);
    }

    for cert in native_certs.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Warning adding cert to store: {}", e);
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("No system root certificates found".into()));
    }

    debug!("Loaded {} root certificates", root_store.len());

    connector_with_roots(root_store)
}

/// Create a TLS connector trusting exactly `roots`.
pub fn connector_with_roots(roots: RootCertStore) -> Result<TlsConnector, ProxyError> {
    let mut config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// System-root connector, or `None` if no usable roots are installed.
pub fn default_connector() -> Option<TlsConnector> {
    match create_tls_connector() {
        Ok(connector) => Some(connector),
        Err(e) => {
            warn!("{}; TLS origins are unavailable", e);
            None
        }
    }
}

/// Convert a domain string to a ServerName for TLS connection.
pub fn domain_to_server_name(domain: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("Invalid server name: {}", domain)))
}
