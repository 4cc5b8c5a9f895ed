//! Certificate authority that signs per-domain leaf certificates.
//!
//! The authority is either generated fresh for the process lifetime or
//! loaded from PEM files supplied by the operator.
//!
//! # Ephemeral mode
//!
//! - ECDSA P-384 CA key, generated at startup
//! - CA certificate and key written to a private temp directory (0700)
//!   so the certificate can be installed in a client trust store
//! - The key file is 0600
//! - The directory is removed when the authority is dropped
//!
//! # Example
//!
//! ```ignore
//! use interpose::certs::{CertificateAuthority, Subject};
//!
//! let ca = CertificateAuthority::generate(Subject::default(), 1)?;
//! println!("trust {}", ca.cert_path().unwrap().display());
//!
//! let record = ca.sign("api.example.com")?;
//! ```

use super::error::CertError;
use super::provider::CertificateRecord;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// PKCS#9 emailAddress.
const EMAIL_ADDRESS_OID: [u64; 7] = [1, 2, 840, 113549, 1, 9, 1];

/// Subject fields stamped on the CA and on every leaf it signs.
#[derive(Debug, Clone)]
pub struct Subject {
    /// Organization (O).
    pub organization: String,
    /// Organizational unit (OU). Skipped when empty.
    pub organization_unit: String,
    /// Country code (C). Skipped when empty.
    pub country: String,
    /// State or province (ST). Skipped when empty.
    pub state: String,
    /// Locality (L). Skipped when empty.
    pub locality: String,
    /// Contact address (emailAddress). Skipped when empty.
    pub email: String,
}

impl Default for Subject {
    fn default() -> Self {
        Self {
            organization: "interpose".to_string(),
            organization_unit: String::new(),
            country: String::new(),
            state: String::new(),
            locality: String::new(),
            email: String::new(),
        }
    }
}

impl Subject {
    fn distinguished_name(&self, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        let optional = [
            (DnType::OrganizationName, &self.organization),
            (DnType::OrganizationalUnitName, &self.organization_unit),
            (DnType::CountryName, &self.country),
            (DnType::StateOrProvinceName, &self.state),
            (DnType::LocalityName, &self.locality),
            (DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()), &self.email),
        ];
        for (ty, value) in optional {
            if !value.is_empty() {
                dn.push(ty, DnValue::Utf8String(value.clone()));
            }
        }
        dn
    }
}

/// Signs leaf certificates for intercepted domains.
pub struct CertificateAuthority {
    /// CA identity and signing key.
    issuer: Issuer<'static, KeyPair>,
    /// PEM-encoded CA certificate.
    cert_pem: String,
    /// Subject fields for signed leaves.
    subject: Subject,
    /// Validity of signed leaves.
    validity: Duration,
    /// Temp directory holding an ephemeral CA, removed on drop.
    temp_dir: Option<PathBuf>,
}

impl CertificateAuthority {
    /// Generate a new ephemeral CA.
    ///
    /// The CA certificate and key are written to a fresh temp directory so
    /// the certificate can be handed to clients. `validity_days` applies to
    /// the CA and to every leaf it signs.
    pub fn generate(subject: Subject, validity_days: i64) -> Result<Self, CertError> {
        info!("Generating ephemeral CA certificate");

        let temp_dir = tempfile::Builder::new()
            .prefix("interpose-ca-")
            .tempdir()
            .map_err(CertError::TempDir)?;

        fs::set_permissions(temp_dir.path(), fs::Permissions::from_mode(0o700))
            .map_err(CertError::Permissions)?;

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CertError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name =
            subject.distinguished_name(&format!("{} Interception CA", subject.organization));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + Duration::days(validity_days.max(1));

        let cert = params
            .clone()
            .self_signed(&key_pair)
            .map_err(|e| CertError::CertGeneration(e.to_string()))?;

        let cert_pem = cert.pem();
        fs::write(temp_dir.path().join("ca.crt"), &cert_pem).map_err(CertError::WriteFile)?;
        write_restricted_file(&temp_dir.path().join("ca.key"), &key_pair.serialize_pem())?;

        let temp_path = temp_dir.keep();
        debug!("Ephemeral CA written to {:?}", temp_path);

        Ok(Self {
            issuer: Issuer::new(params, key_pair),
            cert_pem,
            subject,
            validity: Duration::days(validity_days.max(1)),
            temp_dir: Some(temp_path),
        })
    }

    /// Load a CA from PEM-encoded certificate and key.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        subject: Subject,
        validity_days: i64,
    ) -> Result<Self, CertError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CertError::InvalidCa(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CertError::InvalidCa(e.to_string()))?;

        Ok(Self {
            issuer,
            cert_pem: cert_pem.to_string(),
            subject,
            validity: Duration::days(validity_days.max(1)),
            temp_dir: None,
        })
    }

    /// Load a CA from PEM files on disk.
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        subject: Subject,
        validity_days: i64,
    ) -> Result<Self, CertError> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        info!("Loaded CA certificate from {:?}", cert_path);
        Self::from_pem(&cert_pem, &key_pem, subject, validity_days)
    }

    /// PEM-encoded CA certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Path of the CA certificate file, for ephemeral authorities.
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|dir| dir.join("ca.crt"))
    }

    /// Sign a leaf certificate for `domain`.
    ///
    /// IP literals get an IP SAN, everything else a DNS SAN.
    pub fn sign(&self, domain: &str) -> Result<CertificateRecord, CertError> {
        if domain.is_empty() {
            return Err(CertError::InvalidDomain(domain.to_string()));
        }

        debug!("Signing certificate for {}", domain);

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CertError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = self.subject.distinguished_name(domain);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let san = match domain.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                domain
                    .try_into()
                    .map_err(|_| CertError::InvalidDomain(domain.to_string()))?,
            ),
        };
        params.subject_alt_names = vec![san];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + self.validity;

        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| CertError::Signing(e.to_string()))?;

        Ok(CertificateRecord {
            domain: domain.to_string(),
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            not_after: params.not_after,
        })
    }
}

impl Drop for CertificateAuthority {
    fn drop(&mut self) {
        if let Some(ref dir) = self.temp_dir {
            debug!("Cleaning up ephemeral CA at {:?}", dir);
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!("Failed to clean up CA temp directory: {}", e);
            }
        }
    }
}

fn read_file(path: &Path) -> Result<String, CertError> {
    fs::read_to_string(path).map_err(|source| CertError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, content: &str) -> Result<(), CertError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CertError::WriteFile)?;

    file.write_all(content.as_bytes())
        .map_err(CertError::WriteFile)?;

    Ok(())
}
