//! Configuration schema definitions.
//!
//! This module defines the structure of the interpose configuration files.
//! Every scalar is optional in the file; accessors supply the built-in
//! default when nothing in the hierarchy set a value.

use super::error::ConfigError;
use crate::certs::Subject;
use crate::proxy::forward::{DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Default explicit-proxy port.
pub const DEFAULT_PORT: u16 = 3128;

/// Default lifetime of a cached leaf certificate, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 86400;

/// Default validity of the CA and its leaves, in days.
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Certificate provider settings.
    #[serde(default)]
    pub ssl: SslConfig,

    /// Origin connection settings.
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` override. Maps are merged (later keys win).
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        self.ssl.merge(other.ssl);
        self.forwarder.merge(other.forwarder);
        self.log.merge(other.log);
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.ssl.ca_cert, &self.ssl.ca_key) {
            (Some(_), None) => {
                return Err(ConfigError::invalid(
                    "ssl.ca_key",
                    "ca_cert is set but ca_key is missing",
                ));
            }
            (None, Some(_)) => {
                return Err(ConfigError::invalid(
                    "ssl.ca_cert",
                    "ca_key is set but ca_cert is missing",
                ));
            }
            _ => {}
        }

        if let Some(transparent) = self.proxy.transparent_port
            && transparent != 0
            && transparent == self.proxy.port()
        {
            return Err(ConfigError::invalid(
                "proxy.transparent_port",
                format!("port {} is already the explicit proxy port", transparent),
            ));
        }

        if let Some(days) = self.ssl.validity_days
            && days < 1
        {
            return Err(ConfigError::invalid("ssl.validity_days", "must be at least 1"));
        }

        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address both listeners bind to.
    #[serde(default)]
    pub listen_host: Option<IpAddr>,

    /// Explicit-proxy port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Transparent interception port. Disabled when unset.
    #[serde(default)]
    pub transparent_port: Option<u16>,
}

impl ProxyConfig {
    fn merge(&mut self, other: ProxyConfig) {
        if other.listen_host.is_some() {
            self.listen_host = other.listen_host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.transparent_port.is_some() {
            self.transparent_port = other.transparent_port;
        }
    }

    /// Bind address, all interfaces by default.
    pub fn listen_host(&self) -> IpAddr {
        self.listen_host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Explicit-proxy port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Certificate provider settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    /// CA certificate (PEM). An ephemeral CA is generated when unset.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// CA private key (PEM).
    #[serde(default)]
    pub ca_key: Option<PathBuf>,

    /// Seconds a signed leaf stays cached.
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Validity of generated certificates in days.
    #[serde(default)]
    pub validity_days: Option<i64>,

    /// Subject organization (O).
    #[serde(default)]
    pub organization: Option<String>,

    /// Subject organizational unit (OU).
    #[serde(default)]
    pub organization_unit: Option<String>,

    /// Subject country (C).
    #[serde(default)]
    pub country: Option<String>,

    /// Subject state (ST).
    #[serde(default)]
    pub state: Option<String>,

    /// Subject locality (L).
    #[serde(default)]
    pub locality: Option<String>,

    /// Subject email address.
    #[serde(default)]
    pub email: Option<String>,
}

impl SslConfig {
    fn merge(&mut self, other: SslConfig) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.ca_cert, other.ca_cert);
        take(&mut self.ca_key, other.ca_key);
        take(&mut self.ttl_secs, other.ttl_secs);
        take(&mut self.validity_days, other.validity_days);
        take(&mut self.organization, other.organization);
        take(&mut self.organization_unit, other.organization_unit);
        take(&mut self.country, other.country);
        take(&mut self.state, other.state);
        take(&mut self.locality, other.locality);
        take(&mut self.email, other.email);
    }

    /// Cache lifetime for signed leaves.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.unwrap_or(DEFAULT_TTL_SECS))
    }

    /// Certificate validity in days.
    pub fn validity_days(&self) -> i64 {
        self.validity_days.unwrap_or(DEFAULT_VALIDITY_DAYS)
    }

    /// Subject fields for the CA and its leaves.
    pub fn subject(&self) -> Subject {
        let defaults = Subject::default();
        let or = |value: &Option<String>, fallback: String| value.clone().unwrap_or(fallback);
        Subject {
            organization: or(&self.organization, defaults.organization),
            organization_unit: or(&self.organization_unit, defaults.organization_unit),
            country: or(&self.country, defaults.country),
            state: or(&self.state, defaults.state),
            locality: or(&self.locality, defaults.locality),
            email: or(&self.email, defaults.email),
        }
    }
}

/// Origin connection settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForwarderConfig {
    /// Origin port for plain requests.
    #[serde(default)]
    pub http_port: Option<u16>,

    /// Origin port for decrypted requests.
    #[serde(default)]
    pub https_port: Option<u16>,

    /// Static host overrides (host -> IP).
    #[serde(default)]
    pub resolve: HashMap<String, IpAddr>,
}

impl ForwarderConfig {
    fn merge(&mut self, other: ForwarderConfig) {
        if other.http_port.is_some() {
            self.http_port = other.http_port;
        }
        if other.https_port.is_some() {
            self.https_port = other.https_port;
        }
        self.resolve.extend(other.resolve);
    }

    /// Origin port for plain requests.
    pub fn http_port(&self) -> u16 {
        self.http_port.unwrap_or(DEFAULT_HTTP_PORT)
    }

    /// Origin port for decrypted requests.
    pub fn https_port(&self) -> u16 {
        self.https_port.unwrap_or(DEFAULT_HTTPS_PORT)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Filter directive: trace, debug, info, warn, error, or an `EnvFilter`
    /// expression.
    #[serde(default)]
    pub level: Option<String>,
}

impl LogConfig {
    fn merge(&mut self, other: LogConfig) {
        if other.level.is_some() {
            self.level = other.level;
        }
    }
}
