//! interpose: intercepting HTTP/HTTPS proxy
//!
//! This crate provides a man-in-the-middle proxy that decrypts TLS with
//! certificates forged on the fly, runs every decrypted or plain request
//! through a user-supplied middleware chain, and forwards it to the real
//! origin.
//!
//! # Architecture
//!
//! - **Proxy**: Connection dispatcher, interception tunnels, SNI sniffing,
//!   middleware pipeline and request forwarder
//! - **Certs**: Certificate provider boundary and a local signing CA
//! - **Config**: Hierarchical TOML configuration for the binary
//! - **CLI**: Command-line flags for the binary

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod certs;
pub mod cli;
pub mod config;
pub mod proxy;
