//! Error types for proxy operations.
//!
//! Every variant is scoped to a single connection:
//! - Classification errors (no SNI, malformed CONNECT target)
//! - Certificate acquisition errors
//! - Transport errors (origin unreachable, bridge I/O)
//! - Application errors raised by middleware

use crate::certs::CertError;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Transparent connection did not start with a ClientHello carrying SNI.
    #[error("No server name in TLS handshake from {0}")]
    SniNotFound(String),

    /// Request target could not be rebuilt as a URI.
    #[error("Invalid request target: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    /// Request has no usable origin host.
    #[error("Missing host: {0}")]
    MissingHost(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The certificate provider failed.
    #[error("Certificate acquisition failed for {domain}: {source}")]
    Certificate {
        /// Domain the certificate was requested for.
        domain: String,
        /// The provider's error.
        #[source]
        source: CertError,
    },

    /// Failed to connect to the origin server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The proxy was built without a certificate provider.
    #[error("No certificate provider configured")]
    MissingProvider,

    /// A middleware handler failed.
    #[error("Middleware error: {0}")]
    Middleware(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A pipeline stage panicked.
    #[error("Middleware panicked: {0}")]
    Panic(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Wrap an arbitrary handler error.
    pub fn middleware<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ProxyError::Middleware(err.into())
    }

    /// Whether this is an ordinary peer hang-up rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => is_disconnect(e),
            ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            _ => false,
        }
    }
}

/// Resets, broken pipes and short reads are how peers normally leave.
pub(crate) fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
