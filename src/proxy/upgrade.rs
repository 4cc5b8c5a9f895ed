//! Protocol upgrade bridge (WebSocket and friends).
//!
//! Upgrade requests skip the middleware pipeline. The request head is
//! replayed to the origin; if it answers `101 Switching Protocols`, both
//! upgraded streams are spliced together until either closes. Anything
//! else the origin answers is relayed as an ordinary response.

use super::connect::parse_host_port;
use super::context::{empty_body, ProxyBody, Transport};
use super::dispatch::ConnInfo;
use super::error::{ProxyError, ProxyResult};
use super::forward::{send_request, Forwarder};
use super::tls::domain_to_server_name;
use super::tunnel::splice;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HOST, UPGRADE};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

/// Origin port that is reached without TLS.
const PLAIN_PORT: u16 = 80;

/// Whether `req` asks for a protocol upgrade.
pub fn is_upgrade<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(UPGRADE)
}

/// Replay an upgrade request to its origin and bridge the result.
///
/// A failure to reach the origin is fatal to this connection only.
pub async fn handle_upgrade(
    forwarder: &Forwarder,
    mut req: Request<Incoming>,
    conn: ConnInfo,
) -> ProxyResult<Response<ProxyBody>> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProxyError::MissingHost("upgrade request has no Host".into()))?,
    };
    let default_port = match conn.transport {
        Transport::Plain => PLAIN_PORT,
        Transport::Tls => 443,
    };
    let (host, port) = parse_host_port(&authority, default_port)?;
    let use_tls = port != PLAIN_PORT;

    debug!(
        "Upgrade to {:?} via {}:{} (tls: {}) from {}",
        req.headers().get(UPGRADE),
        host,
        port,
        use_tls,
        conn.remote_addr
    );

    let client_upgrade = hyper::upgrade::on(&mut req);

    let (mut parts, body) = req.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .parse::<Uri>()?;
    parts.uri = target;
    let outbound = Request::from_parts(parts, body.boxed());

    let stream = forwarder.connect(&host, port).await?;
    let mut response = if use_tls {
        let connector = forwarder
            .tls_connector()
            .ok_or_else(|| ProxyError::Tls("no trusted roots for origin TLS".into()))?;
        let tls = connector
            .connect(domain_to_server_name(&host)?, stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake with {} failed: {}", host, e)))?;
        send_request(tls, outbound).await?
    } else {
        send_request(stream, outbound).await?
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!("Origin {} declined upgrade with {}", host, response.status());
        return Ok(response.map(|body| body.boxed()));
    }

    let origin_upgrade = hyper::upgrade::on(&mut response);
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, origin_upgrade) {
            Ok((client, origin)) => {
                if let Err(e) = splice(TokioIo::new(client), TokioIo::new(origin)).await {
                    debug!("Upgrade bridge to {} ended: {}", host, e);
                }
            }
            Err(e) => warn!("Upgrade to {} failed: {}", host, e),
        }
    });

    let (parts, _) = response.into_parts();
    Ok(Response::from_parts(parts, empty_body()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_upgrade() {
        let plain = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_upgrade(&plain));

        let websocket = Request::builder()
            .uri("/chat")
            .header(UPGRADE, "websocket")
            .header("connection", "Upgrade")
            .body(())
            .unwrap();
        assert!(is_upgrade(&websocket));
    }
}
