//! The innermost pipeline stage: relay the request to its origin.
//!
//! The origin is the `Host` header's host, on the HTTP port for plain
//! requests and the HTTPS port for decrypted ones. Method, headers and body
//! go out untouched and the origin's response comes back untouched; any
//! rewriting belongs to middleware around this stage.

use super::connect::parse_host_port;
use super::context::{empty_body, Context, ProxyBody, Transport};
use super::error::{ProxyError, ProxyResult};
use super::tls::{default_connector, domain_to_server_name};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Default origin port for plain requests.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default origin port for decrypted requests.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Relays requests to the real origin.
pub struct Forwarder {
    http_port: u16,
    https_port: u16,
    resolve: HashMap<String, IpAddr>,
    tls: Option<TlsConnector>,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    /// Forwarder using ports 80/443 and system TLS roots.
    pub fn new() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            resolve: HashMap::new(),
            tls: default_connector(),
        }
    }

    /// Override the origin ports.
    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    /// Pin `host` to `ip` instead of resolving it.
    pub fn with_resolve(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.resolve.insert(host.into().to_ascii_lowercase(), ip);
        self
    }

    /// Use `connector` for TLS origins.
    pub fn with_tls_connector(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Origin port for a transport.
    pub fn port_for(&self, transport: Transport) -> u16 {
        match transport {
            Transport::Plain => self.http_port,
            Transport::Tls => self.https_port,
        }
    }

    /// Send the context's request to its origin and store the response.
    pub async fn forward(&self, ctx: &mut Context) -> ProxyResult<()> {
        let host_header = ctx
            .request()
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::MissingHost("request has no Host header".into()))?;
        let (host, _) = parse_host_port(host_header, 0)?;

        let transport = ctx.transport();
        let port = self.port_for(transport);

        let target = match ctx.request().uri.query() {
            Some(query) if ctx.is_absolute_form() => format!("{}?{}", ctx.path(), query),
            _ => ctx.path().to_string(),
        };

        let mut outbound = Request::new(ctx.take_body().unwrap_or_else(empty_body));
        *outbound.method_mut() = ctx.request().method.clone();
        *outbound.uri_mut() = target.parse::<Uri>()?;
        *outbound.headers_mut() = ctx.request().headers.clone();
        // Carries the header case recorded by the inbound connection.
        *outbound.extensions_mut() = ctx.request().extensions.clone();

        debug!(
            "Forwarding {} {}://{}:{}{}",
            outbound.method(),
            transport.scheme(),
            host,
            port,
            target
        );

        let stream = self.connect(&host, port).await?;
        let response = match transport {
            Transport::Plain => send_request(stream, outbound).await?,
            Transport::Tls => {
                let connector = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| ProxyError::Tls("no trusted roots for origin TLS".into()))?;
                let server_name = domain_to_server_name(&host)?;
                let tls = connector.connect(server_name, stream).await.map_err(|e| {
                    ProxyError::Tls(format!("Upstream TLS handshake with {} failed: {}", host, e))
                })?;
                send_request(tls, outbound).await?
            }
        };

        ctx.respond(response.map(|body| body.boxed()));
        Ok(())
    }

    /// Open a TCP connection to `host:port`, honoring resolve overrides.
    pub(crate) async fn connect(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        let pinned = self.resolve.get(&host.to_ascii_lowercase()).copied();
        let result = match pinned {
            Some(ip) => TcpStream::connect(SocketAddr::new(ip, port)).await,
            None => TcpStream::connect((host, port)).await,
        };
        result.map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })
    }

    /// TLS connector for origins, if roots are available.
    pub(crate) fn tls_connector(&self) -> Option<&TlsConnector> {
        self.tls.as_ref()
    }
}

/// Run one HTTP/1 exchange over `stream`.
///
/// The connection task keeps running after the head arrives so the body
/// can stream, and it supports upgrades for 101 responses.
pub(crate) async fn send_request<S>(
    stream: S,
    req: Request<ProxyBody>,
) -> ProxyResult<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Origin connection ended: {}", e);
        }
    });

    Ok(sender.send_request(req).await?)
}
