//! Error types for certificate operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while creating, loading or signing certificates.
#[derive(Debug, Error)]
pub enum CertError {
    /// Failed to create temporary directory for CA files.
    #[error("Failed to create temp directory: {0}")]
    TempDir(#[source] std::io::Error),

    /// Failed to set file permissions.
    #[error("Failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Failed to generate key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to generate certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to write certificate or key file.
    #[error("Failed to write file: {0}")]
    WriteFile(#[source] std::io::Error),

    /// Failed to read CA files.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// CA certificate or key PEM could not be parsed.
    #[error("Invalid CA material: {0}")]
    InvalidCa(String),

    /// Domain is not usable as a certificate subject.
    #[error("Invalid domain '{0}'")]
    InvalidDomain(String),

    /// Failed to sign certificate.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),

    /// Background signing task was cancelled or panicked.
    #[error("Certificate task failed: {0}")]
    Task(String),
}
