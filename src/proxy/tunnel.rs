//! TLS interception tunnel.
//!
//! A tunnel makes one intercepted TLS connection look like a plain
//! decrypted HTTP connection to the rest of the proxy:
//!
//! ```text
//!   client ──raw TLS──> tunnel ──unix socket──> endpoint (TLS terminated)
//!                                                  │
//!                                        dispatcher / pipeline
//! ```
//!
//! States run `Created -> AwaitingCertificate -> EndpointStarting ->
//! Bridging -> Closed`. `Closed` is reached once, from whichever side ends
//! first, and always releases the endpoint.

use super::dispatch::Dispatcher;
use super::endpoint::EphemeralEndpoint;
use super::error::{is_disconnect, ProxyError, ProxyResult};
use super::tls::create_tls_acceptor;
use crate::certs::CertificateRecord;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Constructed, nothing requested yet.
    Created,
    /// Waiting on the certificate provider.
    AwaitingCertificate,
    /// Certificate in hand, endpoint being stood up.
    EndpointStarting,
    /// Relaying bytes between client and endpoint.
    Bridging,
    /// Terminal.
    Closed,
}

/// One interception tunnel per intercepted connection.
pub struct Tunnel {
    id: Uuid,
    domain: String,
    remote_addr: SocketAddr,
    state: TunnelState,
    certificate: Option<CertificateRecord>,
    dispatcher: Arc<Dispatcher>,
}

impl Tunnel {
    /// New tunnel for `domain`, on behalf of the client at `remote_addr`.
    pub fn new(domain: impl Into<String>, remote_addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            remote_addr,
            state: TunnelState::Created,
            certificate: None,
            dispatcher,
        }
    }

    /// Identifier used in log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Intercepted domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Obtain the certificate for this tunnel's domain.
    ///
    /// The provider is consulted at most once; a failure closes the tunnel
    /// before it ever bridges.
    pub async fn acquire_certificate(&mut self) -> ProxyResult<()> {
        if self.certificate.is_some() {
            return Ok(());
        }
        if self.state == TunnelState::Closed {
            return Err(ProxyError::Tls(format!("tunnel {} already closed", self.id)));
        }

        self.state = TunnelState::AwaitingCertificate;
        debug!("Tunnel {} requesting certificate for {}", self.id, self.domain);

        match self
            .dispatcher
            .provider()
            .request_certificate(&self.domain)
            .await
        {
            Ok(record) => {
                self.certificate = Some(record);
                Ok(())
            }
            Err(source) => {
                self.state = TunnelState::Closed;
                warn!(
                    "Tunnel {} could not get a certificate for {}: {}",
                    self.id, self.domain, source
                );
                Err(ProxyError::Certificate {
                    domain: self.domain.clone(),
                    source,
                })
            }
        }
    }

    /// Bridge `client` through a fresh endpoint until either side ends.
    ///
    /// `initial` holds bytes already read from the client (the sniffed
    /// ClientHello in transparent mode); they are delivered to the endpoint
    /// before anything else.
    pub async fn run<S>(mut self, client: S, initial: Bytes) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.acquire_certificate().await?;
        let result = self.bridge(client, initial).await;
        self.state = TunnelState::Closed;
        debug!("Tunnel {} for {} closed", self.id, self.domain);
        result
    }

    async fn bridge<S>(&mut self, client: S, initial: Bytes) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let record = self
            .certificate
            .take()
            .ok_or_else(|| ProxyError::Tls(format!("tunnel {} has no certificate", self.id)))?;

        self.state = TunnelState::EndpointStarting;
        let acceptor = create_tls_acceptor(&record)?;
        let endpoint = EphemeralEndpoint::start(
            self.id,
            acceptor,
            self.dispatcher.clone(),
            self.remote_addr,
        )?;

        let mut local = UnixStream::connect(endpoint.path()).await?;
        if !initial.is_empty() {
            local.write_all(&initial).await?;
        }

        self.state = TunnelState::Bridging;
        info!(
            "Tunnel {} intercepting {} for {}",
            self.id, self.domain, self.remote_addr
        );

        let result = splice(client, local).await;
        endpoint.close();
        result.map_err(ProxyError::from)
    }
}

/// Relay bytes both ways until the far side (`b`) finishes.
///
/// When `a` stops sending, `b` is shut down for writing and its remaining
/// output is still drained back to `a`. When `b` finishes, the relay ends
/// at once. Resets and broken pipes count as ordinary termination.
pub(crate) async fn splice<A, B>(a: A, b: B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let inbound = async {
        tokio::io::copy(&mut a_read, &mut b_write).await?;
        b_write.shutdown().await
    };
    let outbound = async {
        tokio::io::copy(&mut b_read, &mut a_write).await?;
        a_write.shutdown().await
    };
    tokio::pin!(inbound, outbound);

    let result = tokio::select! {
        result = &mut outbound => result,
        result = &mut inbound => match result {
            Ok(()) => outbound.await,
            Err(e) => Err(e),
        },
    };

    match result {
        Err(e) if is_disconnect(&e) => Ok(()),
        other => other,
    }
}
