//! Interception and tunneling engine.
//!
//! This module provides the MITM proxy core:
//! - Connection classification (plain HTTP, `CONNECT`, upgrade, transparent TLS)
//! - SNI extraction from a raw TLS ClientHello
//! - Per-connection TLS termination tunnels with forged certificates
//! - An onion-ordered middleware pipeline around the request forwarder
//!
//! # Architecture
//!
//! ```text
//!  explicit listener ──┬── plain request ─────────────> Pipeline ──> Forwarder ──> origin
//!                      ├── Upgrade ───────────────────> upgrade bridge ──────────> origin
//!                      └── CONNECT ──┐
//!                                    ├─> Tunnel ──> EphemeralEndpoint (TLS off)
//!  transparent listener ── SNI ──────┘                   │
//!                                                        └──> Dispatcher (Transport::Tls)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use interpose::proxy::Proxy;
//!
//! let listening = Proxy::builder()
//!     .provider(provider)
//!     .with(MyMiddleware)
//!     .build()?
//!     .listen(3128, None)
//!     .await?;
//! ```

pub mod connect;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod middleware;
pub mod server;
pub mod sni;
pub mod tls;
pub mod tunnel;
pub mod upgrade;

// Re-export main types for convenient access
pub use context::{Context, ProxyBody, Transport, empty_body, full_body, status_response};
pub use dispatch::{ConnInfo, Dispatcher};
pub use error::{ProxyError, ProxyResult};
pub use forward::Forwarder;
pub use middleware::{Middleware, Next, Pipeline};
pub use server::{Listening, Proxy, ProxyBuilder};
pub use tls::{connector_with_roots, create_tls_acceptor, create_tls_connector};
pub use tunnel::{Tunnel, TunnelState};
