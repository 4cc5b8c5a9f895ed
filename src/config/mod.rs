//! Configuration system for interpose.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/interpose/config.toml`
//! 3. User config: `~/.config/interpose/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Missing system and user files are skipped. A `--config` file must exist.
//!
//! # Merge Behavior
//!
//! - **Scalars** (ports, paths, subject fields) are **overridden**
//! - **Maps** (`forwarder.resolve`) are **merged** (later values override)
//!
//! # Example
//!
//! ```toml
//! [proxy]
//! port = 3128
//! transparent_port = 3129
//!
//! [ssl]
//! ca_cert = "/etc/interpose/ca.crt"
//! ca_key = "/etc/interpose/ca.key"
//! organization = "Example Corp"
//!
//! [forwarder]
//! resolve = { "staging.example.com" = "10.0.0.7" }
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, ForwarderConfig, LogConfig, ProxyConfig, SslConfig, DEFAULT_PORT, DEFAULT_TTL_SECS,
    DEFAULT_VALIDITY_DAYS,
};
