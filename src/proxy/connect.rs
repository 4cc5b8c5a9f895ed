//! HTTP CONNECT handling for explicit-proxy HTTPS interception.
//!
//! The flow is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. Proxy requests a certificate for `api.example.com`
//! 3. On success: answer `200 Connection established` and upgrade
//! 4. On failure: fail the connection without an HTTP answer
//!
//! After the upgrade the raw client stream is handed to a [`Tunnel`], which
//! terminates TLS with the issued certificate and feeds the decrypted
//! requests back through the dispatcher.

use super::context::{empty_body, ProxyBody};
use super::dispatch::{ConnInfo, Dispatcher};
use super::error::{ProxyError, ProxyResult};
use super::tunnel::Tunnel;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default port for a CONNECT target without one.
const DEFAULT_CONNECT_PORT: u16 = 443;

/// Handle an HTTP CONNECT request for HTTPS interception.
///
/// The certificate is obtained before answering, so a provider failure
/// surfaces as an error and hyper drops the connection instead of sending
/// the acknowledgement.
pub async fn handle_connect(
    dispatcher: Arc<Dispatcher>,
    req: Request<Incoming>,
    conn: ConnInfo,
) -> ProxyResult<Response<ProxyBody>> {
    let target = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?
        .to_string();

    let (host, port) = parse_host_port(&target, DEFAULT_CONNECT_PORT)?;

    debug!("CONNECT request to {}:{} from {}", host, port, conn.remote_addr);

    let mut tunnel = Tunnel::new(host, conn.remote_addr, dispatcher);
    tunnel.acquire_certificate().await?;

    let version = req.version();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let id = tunnel.id();
                if let Err(e) = tunnel.run(TokioIo::new(upgraded), Bytes::new()).await {
                    if e.is_disconnect() {
                        debug!("Tunnel {} ended: {}", id, e);
                    } else {
                        warn!("Tunnel {} failed: {}", id, e);
                    }
                }
            }
            Err(e) => {
                warn!("CONNECT upgrade failed for {}: {}", target, e);
            }
        }
    });

    Ok(connection_established(version))
}

/// `200 Connection established` on the client's protocol version.
fn connection_established(version: hyper::Version) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    *response.version_mut() = version;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection established"));
    response
}

/// Split an authority into host and port.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", `default_port`)
/// - `[::1]:8443` -> ("::1", 8443)
pub fn parse_host_port(authority: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    if authority.is_empty() {
        return Err(ProxyError::InvalidConnect("Empty authority".into()));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::InvalidConnect(format!("Unclosed IPv6 literal: {}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(port_str) => parse_port(port_str)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(ProxyError::InvalidConnect(format!(
                    "Invalid authority: {}",
                    authority
                )));
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?)),
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(port_str: &str) -> ProxyResult<u16> {
    port_str
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))
}
