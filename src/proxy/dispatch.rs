//! Connection classification and routing.
//!
//! Every connection the proxy sees, including the decrypted ones coming
//! out of a tunnel endpoint, is routed here:
//!
//! - `CONNECT` -> [`handle_connect`] (interception tunnel)
//! - `Upgrade` header -> [`handle_upgrade`] (raw bridge, no pipeline)
//! - anything else -> the middleware [`Pipeline`]
//!
//! Raw connections on the transparent listener are classified by SNI
//! instead of by HTTP.

use super::connect::handle_connect;
use super::context::{Context, ProxyBody, Transport};
use super::error::{ProxyError, ProxyResult};
use super::forward::Forwarder;
use super::middleware::Pipeline;
use super::sni;
use super::tunnel::Tunnel;
use super::upgrade::{handle_upgrade, is_upgrade};
use crate::certs::CertificateProvider;
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Bytes read from a transparent connection before classifying it: one
/// maximum-size TLS record plus its header.
pub const TRANSPARENT_READ_LIMIT: usize = 16 * 1024 + 5;

/// Where a connection came from.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    /// Plain, or decrypted by a tunnel.
    pub transport: Transport,
    /// The original client, never the local bridge.
    pub remote_addr: SocketAddr,
}

/// Routes requests and raw connections to the right handler.
pub struct Dispatcher {
    pipeline: Pipeline,
    provider: Arc<dyn CertificateProvider>,
}

impl Dispatcher {
    /// Create a dispatcher over a frozen pipeline.
    pub fn new(pipeline: Pipeline, provider: Arc<dyn CertificateProvider>) -> Self {
        Self { pipeline, provider }
    }

    /// Certificate provider used by tunnels.
    pub fn provider(&self) -> &Arc<dyn CertificateProvider> {
        &self.provider
    }

    /// Forwarder at the bottom of the pipeline.
    pub fn forwarder(&self) -> &Forwarder {
        self.pipeline.forwarder()
    }

    /// Route one HTTP request.
    ///
    /// Boxed because tunnels re-enter the dispatcher from their endpoints.
    pub fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        conn: ConnInfo,
    ) -> BoxFuture<'static, ProxyResult<Response<ProxyBody>>> {
        Box::pin(async move {
            if req.method() == Method::CONNECT {
                return handle_connect(self, req, conn).await;
            }
            if is_upgrade(&req) {
                return handle_upgrade(self.forwarder(), req, conn).await;
            }
            let ctx = Context::new(req, conn.transport, conn.remote_addr);
            Ok(self.pipeline.run(ctx).await)
        })
    }

    /// Serve HTTP/1 on `io`, routing each request through [`dispatch`].
    ///
    /// [`dispatch`]: Dispatcher::dispatch
    pub async fn serve_http<S>(self: Arc<Self>, io: S, conn: ConnInfo) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| self.clone().dispatch(req, conn));

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
            .map_err(ProxyError::from)
    }

    /// Intercept a raw connection from the transparent listener.
    ///
    /// The first chunk must be a ClientHello carrying SNI; it is replayed
    /// into the tunnel so the client never resends it.
    pub async fn serve_transparent(
        self: Arc<Self>,
        mut stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> ProxyResult<()> {
        let buf = read_first_record(&mut stream).await?;

        let domain =
            sni::extract(&buf).ok_or_else(|| ProxyError::SniNotFound(remote_addr.to_string()))?;
        debug!("Transparent connection from {} for {}", remote_addr, domain);

        let mut tunnel = Tunnel::new(domain, remote_addr, self);
        tunnel.acquire_certificate().await?;
        tunnel.run(stream, Bytes::from(buf)).await
    }
}

/// Read the first TLS record, which may span several TCP segments.
///
/// Stops at the record's declared length, at [`TRANSPARENT_READ_LIMIT`],
/// at EOF, or as soon as the first byte shows it is not a handshake.
async fn read_first_record<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; TRANSPARENT_READ_LIMIT];
    let mut filled = 0;

    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;

        if buf[0] != sni::TLS_HANDSHAKE_TYPE {
            break;
        }
        if filled >= 5 {
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            if filled >= (5 + record_len).min(TRANSPARENT_READ_LIMIT) {
                break;
            }
        }
    }

    buf.truncate(filled);
    Ok(buf)
}
