//! Proxy instance and its listeners.
//!
//! A [`Proxy`] collects middleware and collaborators, then [`Proxy::bind`]
//! freezes them into a pipeline and starts up to two accept loops:
//!
//! - the explicit-proxy listener (plain HTTP, `CONNECT`, upgrades)
//! - the optional transparent listener (raw TLS, classified by SNI)
//!
//! Each accepted connection runs in its own task. Failures stay inside that
//! task; the listeners keep accepting.
//!
//! # Example
//!
//! ```ignore
//! use interpose::certs::{CachingProvider, CertificateAuthority, Subject};
//! use interpose::proxy::Proxy;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let ca = Arc::new(CertificateAuthority::generate(Subject::default(), 365)?);
//! let provider = Arc::new(CachingProvider::new(ca, Duration::from_secs(86400)));
//!
//! let mut proxy = Proxy::new(provider);
//! proxy.use_middleware(MyLogger);
//! let listening = proxy.listen(3128, Some(3129)).await?;
//!
//! tokio::signal::ctrl_c().await?;
//! listening.shutdown();
//! listening.wait().await;
//! ```

use super::context::Transport;
use super::dispatch::{ConnInfo, Dispatcher};
use super::error::{ProxyError, ProxyResult};
use super::forward::Forwarder;
use super::middleware::{Middleware, Pipeline};
use crate::certs::CertificateProvider;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// The proxy instance: middleware plus collaborators, not yet listening.
pub struct Proxy {
    provider: Arc<dyn CertificateProvider>,
    forwarder: Forwarder,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Proxy {
    /// Proxy with a default forwarder and no middleware.
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self {
            provider,
            forwarder: Forwarder::new(),
            middleware: Vec::new(),
        }
    }

    /// Start configuring a proxy.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// Append a middleware handler. Handlers run in registration order.
    pub fn use_middleware<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Number of registered handlers.
    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    /// Listen on all interfaces.
    pub async fn listen(
        self,
        explicit_port: u16,
        transparent_port: Option<u16>,
    ) -> ProxyResult<Listening> {
        let any = |port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        self.bind(any(explicit_port), transparent_port.map(any)).await
    }

    /// Listen on exact addresses.
    ///
    /// Middleware registration ends here: the chain is frozen for every
    /// connection this call accepts.
    pub async fn bind(
        self,
        explicit: SocketAddr,
        transparent: Option<SocketAddr>,
    ) -> ProxyResult<Listening> {
        let explicit_listener = TcpListener::bind(explicit).await?;
        let transparent_listener = match transparent {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let pipeline = Pipeline::new(self.middleware, Arc::new(self.forwarder));
        let dispatcher = Arc::new(Dispatcher::new(pipeline, self.provider));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let explicit_addr = explicit_listener.local_addr()?;
        info!("Proxy listening on {}", explicit_addr);
        let mut tasks = vec![tokio::spawn(accept_loop(
            explicit_listener,
            ListenerKind::Explicit,
            dispatcher.clone(),
            shutdown_rx.clone(),
        ))];

        let transparent_addr = match transparent_listener {
            Some(listener) => {
                let addr = listener.local_addr()?;
                info!("Transparent interception listening on {}", addr);
                tasks.push(tokio::spawn(accept_loop(
                    listener,
                    ListenerKind::Transparent,
                    dispatcher,
                    shutdown_rx,
                )));
                Some(addr)
            }
            None => None,
        };

        Ok(Listening {
            explicit_addr,
            transparent_addr,
            shutdown_tx,
            tasks,
        })
    }
}

/// Builder for [`Proxy`].
#[derive(Default)]
pub struct ProxyBuilder {
    provider: Option<Arc<dyn CertificateProvider>>,
    forwarder: Option<Forwarder>,
    upstream_tls: Option<TlsConnector>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl ProxyBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the certificate provider (required).
    pub fn provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the forwarder.
    pub fn forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Set the connector used for TLS origins.
    pub fn upstream_tls(mut self, connector: TlsConnector) -> Self {
        self.upstream_tls = Some(connector);
        self
    }

    /// Append a middleware handler.
    pub fn with<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Build the proxy.
    pub fn build(self) -> ProxyResult<Proxy> {
        let provider = self.provider.ok_or(ProxyError::MissingProvider)?;
        let mut forwarder = self.forwarder.unwrap_or_default();
        if let Some(connector) = self.upstream_tls {
            forwarder = forwarder.with_tls_connector(connector);
        }

        Ok(Proxy {
            provider,
            forwarder,
            middleware: self.middleware,
        })
    }
}

/// Handle to running listeners.
///
/// Dropping it stops the listeners like [`Listening::shutdown`].
pub struct Listening {
    explicit_addr: SocketAddr,
    transparent_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listening {
    /// Bound address of the explicit-proxy listener.
    pub fn explicit_addr(&self) -> SocketAddr {
        self.explicit_addr
    }

    /// Bound address of the transparent listener, if started.
    pub fn transparent_addr(&self) -> Option<SocketAddr> {
        self.transparent_addr
    }

    /// Stop accepting. Connections already accepted run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the accept loops to exit.
    pub async fn wait(mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Listener task failed: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ListenerKind {
    Explicit,
    Transparent,
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        debug!("Accepted {:?} connection from {}", kind, addr);
                        spawn_connection_handler(stream, addr, kind, dispatcher.clone());
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("{:?} listener shutting down", kind);
                    break;
                }
            }
        }
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection_handler(
    stream: TcpStream,
    addr: SocketAddr,
    kind: ListenerKind,
    dispatcher: Arc<Dispatcher>,
) {
    tokio::spawn(async move {
        let result = match kind {
            ListenerKind::Explicit => {
                let conn = ConnInfo {
                    transport: Transport::Plain,
                    remote_addr: addr,
                };
                dispatcher.serve_http(stream, conn).await
            }
            ListenerKind::Transparent => dispatcher.serve_transparent(stream, addr).await,
        };

        if let Err(e) = result {
            if e.is_disconnect() {
                debug!("Connection from {} ended: {}", addr, e);
            } else {
                warn!("Connection from {} failed: {}", addr, e);
            }
        }
    });
}
