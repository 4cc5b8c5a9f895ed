//! Certificate provisioning for TLS interception.
//!
//! The proxy treats certificate generation as an external collaborator: it
//! calls [`CertificateProvider::request_certificate`] and uses whatever
//! comes back. This module ships the default provider, a [`CachingProvider`]
//! on top of a [`CertificateAuthority`].

mod authority;
mod error;
mod provider;

pub use authority::{CertificateAuthority, Subject};
pub use error::CertError;
pub use provider::{CachingProvider, CertificateProvider, CertificateRecord};
