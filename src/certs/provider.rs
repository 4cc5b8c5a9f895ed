//! The certificate provider boundary.
//!
//! The proxy core asks a [`CertificateProvider`] for a signed key pair once
//! per tunnel and never stores the result. [`CachingProvider`] is the stock
//! implementation: it signs with a [`CertificateAuthority`] and keeps
//! records until they reach their TTL.

use super::authority::CertificateAuthority;
use super::error::CertError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, trace};

/// A signed certificate and its private key for one domain.
#[derive(Clone)]
pub struct CertificateRecord {
    /// Domain the certificate was issued for.
    pub domain: String,
    /// PEM-encoded certificate chain (leaf first).
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
    /// End of the certificate validity window.
    pub not_after: OffsetDateTime,
}

impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("domain", &self.domain)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Produces certificates for intercepted domains.
///
/// Implementations must tolerate concurrent calls, for the same domain as
/// well as for different ones.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Obtain a certificate and key for `domain`.
    async fn request_certificate(&self, domain: &str) -> Result<CertificateRecord, CertError>;
}

struct CachedRecord {
    record: CertificateRecord,
    expires: Instant,
}

/// Provider that signs with a CA and caches by domain.
///
/// Lookups are case-insensitive. Signing runs on the blocking pool so key
/// generation does not stall connection tasks.
pub struct CachingProvider {
    cache: RwLock<HashMap<String, CachedRecord>>,
    ca: Arc<CertificateAuthority>,
    ttl: Duration,
}

impl CachingProvider {
    /// Create a provider signing with `ca`, caching records for `ttl`.
    pub fn new(ca: Arc<CertificateAuthority>, ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
            ttl,
        }
    }

    /// The authority this provider signs with.
    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Number of cached records.
    ///
    /// Expired records linger until the next insert evicts them.
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached record.
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
        debug!("Certificate cache cleared");
    }

    fn lookup(&self, key: &str) -> Option<CertificateRecord> {
        let cache = self.cache.read().ok()?;
        let cached = cache.get(key)?;
        (cached.expires > Instant::now()).then(|| cached.record.clone())
    }
}

#[async_trait]
impl CertificateProvider for CachingProvider {
    async fn request_certificate(&self, domain: &str) -> Result<CertificateRecord, CertError> {
        let key = domain.to_ascii_lowercase();

        if let Some(record) = self.lookup(&key) {
            trace!("Certificate cache hit for {}", domain);
            return Ok(record);
        }

        let ca = self.ca.clone();
        let sign_for = key.clone();
        let record = tokio::task::spawn_blocking(move || ca.sign(&sign_for))
            .await
            .map_err(|e| CertError::Task(e.to_string()))??;

        if let Ok(mut cache) = self.cache.write() {
            let now = Instant::now();
            let before = cache.len();
            cache.retain(|_, cached| cached.expires > now);
            if cache.len() < before {
                trace!("Evicted {} expired certificates", before - cache.len());
            }
            cache.insert(
                key,
                CachedRecord {
                    record: record.clone(),
                    expires: now + self.ttl,
                },
            );
        }

        Ok(record)
    }
}
