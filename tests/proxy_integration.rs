//! End-to-end tests driving the proxy over real loopback sockets.
//!
//! Each test starts:
//! - a plain and a TLS origin (TLS signed by an origin CA)
//! - the proxy on 127.0.0.1:0 with both listeners, signing with its own CA
//! - clients that trust the proxy CA
//!
//! `example.com` is pinned to 127.0.0.1 in the forwarder, and the origin
//! ports replace 80/443.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, HeaderValue, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use interpose::certs::{
    CachingProvider, CertError, CertificateAuthority, CertificateProvider, CertificateRecord,
    Subject,
};
use interpose::proxy::{
    connector_with_roots, create_tls_acceptor, status_response, Context, Forwarder, Listening,
    Middleware, Next, Proxy, ProxyBuilder, ProxyError, ProxyResult,
};
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    listening: Listening,
    provider: Arc<CachingProvider>,
    client_tls: TlsConnector,
    tls_origin_port: u16,
    _cas: (Arc<CertificateAuthority>, Arc<CertificateAuthority>),
}

fn roots(ca: &CertificateAuthority) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca.cert_pem().as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    roots
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Origin answering with what it saw, and echoing raw bytes after an
/// `Upgrade`.
async fn origin_service(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.headers().contains_key(UPGRADE) {
        tokio::spawn(async move {
            if let Ok(upgraded) = hyper::upgrade::on(req).await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 256];
                while let Ok(n) = io.read(&mut buf).await {
                    if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        });
        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header("connection", "upgrade")
            .header(UPGRADE, "echo")
            .body(Full::new(Bytes::new()))
            .unwrap();
        return Ok(response);
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let line = format!("origin saw {} {} host={}", req.method(), req.uri(), host);
    Ok(Response::new(Full::new(Bytes::from(line))))
}

async fn serve_origin<S>(io: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service_fn(origin_service))
        .with_upgrades()
        .await;
}

async fn spawn_origin(acceptor: Option<TlsAcceptor>) -> u16 {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            serve_origin(tls).await;
                        }
                    }
                    None => serve_origin(stream).await,
                }
            });
        }
    });
    port
}

async fn start(configure: impl FnOnce(ProxyBuilder) -> ProxyBuilder) -> Harness {
    let origin_ca = Arc::new(CertificateAuthority::generate(Subject::default(), 1).unwrap());
    let origin_record = origin_ca.sign("example.com").unwrap();
    let plain_port = spawn_origin(None).await;
    let tls_origin_port = spawn_origin(Some(create_tls_acceptor(&origin_record).unwrap())).await;

    let proxy_ca = Arc::new(CertificateAuthority::generate(Subject::default(), 1).unwrap());
    let provider = Arc::new(CachingProvider::new(
        proxy_ca.clone(),
        Duration::from_secs(60),
    ));

    let forwarder = Forwarder::new()
        .with_ports(plain_port, tls_origin_port)
        .with_resolve("example.com", IpAddr::from([127, 0, 0, 1]));

    let builder = Proxy::builder()
        .provider(provider.clone())
        .forwarder(forwarder)
        .upstream_tls(connector_with_roots(roots(&origin_ca)).unwrap());

    let listening = configure(builder)
        .build()
        .unwrap()
        .bind(loopback(), Some(loopback()))
        .await
        .unwrap();

    Harness {
        listening,
        provider,
        client_tls: connector_with_roots(roots(&proxy_ca)).unwrap(),
        tls_origin_port,
        _cas: (origin_ca, proxy_ca),
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8(head).unwrap()
}

async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut buf)).await;
    buf
}

async fn http_client<S>(io: S) -> SendRequest<Empty<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

async fn fetch(
    sender: &mut SendRequest<Empty<Bytes>>,
    uri: &str,
    host: &str,
) -> (StatusCode, HeaderMap, String) {
    sender.ready().await.unwrap();
    let req = Request::builder()
        .uri(uri)
        .header(HOST, host)
        .body(Empty::new())
        .unwrap();
    let response = tokio::time::timeout(TIMEOUT, sender.send_request(req))
        .await
        .unwrap()
        .unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (
        parts.status,
        parts.headers,
        String::from_utf8(body.to_vec()).unwrap(),
    )
}

async fn connect_tunnel(h: &Harness, target: &str) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = tokio::time::timeout(TIMEOUT, read_head(&mut stream)).await.unwrap();
    assert!(
        head.starts_with("HTTP/1.1 200 Connection established\r\n"),
        "unexpected CONNECT answer: {head:?}"
    );

    h.client_tls
        .connect(ServerName::try_from("example.com").unwrap(), stream)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_connect_intercepts_and_forwards() {
    let h = start(|b| b).await;

    let tls = connect_tunnel(&h, "example.com:443").await;
    let mut sender = http_client(tls).await;

    let (status, _, body) = fetch(&mut sender, "/first", "example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "origin saw GET /first host=example.com");

    assert_eq!(h.provider.len(), 1);
}

#[tokio::test]
async fn test_tunnel_carries_sequential_requests() {
    let h = start(|b| b).await;

    let tls = connect_tunnel(&h, "example.com:443").await;
    let mut sender = http_client(tls).await;

    for path in ["/one", "/two?x=1", "/three"] {
        let (status, _, body) = fetch(&mut sender, path, "example.com").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("origin saw GET {path} host=example.com"));
    }
}

#[tokio::test]
async fn test_concurrent_tunnels_are_independent() {
    let h = start(|b| b).await;

    let (a, b) = tokio::join!(
        connect_tunnel(&h, "example.com:443"),
        connect_tunnel(&h, "example.com:443")
    );
    let (mut a, mut b) = (http_client(a).await, http_client(b).await);

    let (ra, rb) = tokio::join!(
        fetch(&mut a, "/a", "example.com"),
        fetch(&mut b, "/b", "example.com")
    );
    assert_eq!(ra.2, "origin saw GET /a host=example.com");
    assert_eq!(rb.2, "origin saw GET /b host=example.com");
}

#[tokio::test]
async fn test_transparent_mode_uses_sni() {
    let h = start(|b| b).await;
    let addr = h.listening.transparent_addr().unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let tls = h
        .client_tls
        .connect(ServerName::try_from("example.com").unwrap(), stream)
        .await
        .unwrap();
    let mut sender = http_client(tls).await;

    let (status, _, body) = fetch(&mut sender, "/sniffed", "example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "origin saw GET /sniffed host=example.com");
    assert_eq!(h.provider.len(), 1);
}

#[tokio::test]
async fn test_transparent_rejects_plaintext() {
    let h = start(|b| b).await;
    let addr = h.listening.transparent_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    assert!(read_until_closed(&mut stream).await.is_empty());
    assert!(h.provider.is_empty());
}

#[tokio::test]
async fn test_plain_absolute_form_forwarded() {
    let h = start(|b| b).await;

    let stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let mut sender = http_client(stream).await;

    let (status, _, body) = fetch(&mut sender, "http://example.com/hello?x=1", "example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "origin saw GET /hello?x=1 host=example.com");
}

struct Gate;

#[async_trait]
impl Middleware for Gate {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> ProxyResult<()> {
        if ctx.path() == "/blocked" {
            ctx.respond(status_response(StatusCode::FORBIDDEN));
            return Ok(());
        }
        next.run(ctx).await?;
        if let Some(response) = ctx.response_mut() {
            response
                .headers_mut()
                .insert("x-interposed", HeaderValue::from_static("1"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_middleware_wraps_and_short_circuits() {
    let h = start(|b| b.with(Gate)).await;

    let stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let mut sender = http_client(stream).await;

    let (status, headers, _) = fetch(&mut sender, "http://example.com/open", "example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-interposed").unwrap(), "1");

    let (status, headers, body) =
        fetch(&mut sender, "http://example.com/blocked", "example.com").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Forbidden");
    assert!(headers.get("x-interposed").is_none());
}

#[tokio::test]
async fn test_middleware_sees_decrypted_requests() {
    let h = start(|b| b.with(Gate)).await;

    let tls = connect_tunnel(&h, "example.com:443").await;
    let mut sender = http_client(tls).await;

    let (status, headers, _) = fetch(&mut sender, "/open", "example.com").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-interposed").unwrap(), "1");

    let (status, _, _) = fetch(&mut sender, "/blocked", "example.com").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

struct Failing;

#[async_trait]
impl Middleware for Failing {
    async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> ProxyResult<()> {
        Err(ProxyError::middleware("application failure"))
    }
}

#[tokio::test]
async fn test_application_error_is_500() {
    let h = start(|b| b.with(Failing)).await;

    let stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let mut sender = http_client(stream).await;

    let (status, _, body) = fetch(&mut sender, "http://example.com/", "example.com").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Internal Server Error");

    // The listener survives the failure.
    let stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let mut sender = http_client(stream).await;
    let (status, _, _) = fetch(&mut sender, "http://example.com/", "example.com").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_missing_host_is_500() {
    let h = start(|b| b).await;

    let mut stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    stream.write_all(b"GET /nohost HTTP/1.0\r\n\r\n").await.unwrap();

    let head = tokio::time::timeout(TIMEOUT, read_head(&mut stream)).await.unwrap();
    assert!(head.contains(" 500 "), "unexpected answer: {head:?}");
}

struct Silent;

#[async_trait]
impl Middleware for Silent {
    async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> ProxyResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_unanswered_request_is_404() {
    let h = start(|b| b.with(Silent)).await;

    let stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let mut sender = http_client(stream).await;

    let (status, _, body) = fetch(&mut sender, "http://example.com/", "example.com").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Not Found");
}

struct Refusing;

#[async_trait]
impl CertificateProvider for Refusing {
    async fn request_certificate(&self, domain: &str) -> Result<CertificateRecord, CertError> {
        Err(CertError::InvalidDomain(domain.to_string()))
    }
}

#[tokio::test]
async fn test_certificate_failure_drops_connection() {
    let h = start(|b| b.provider(Arc::new(Refusing))).await;

    let mut stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    assert!(read_until_closed(&mut stream).await.is_empty());
}

#[tokio::test]
async fn test_malformed_connect_target_drops_connection() {
    let h = start(|b| b).await;

    let mut stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    stream
        .write_all(b"CONNECT example.com:notaport HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let answer = read_until_closed(&mut stream).await;
    assert!(!answer.starts_with(b"HTTP/1.1 200"));
    assert!(h.provider.is_empty());
}

#[tokio::test]
async fn test_upgrade_is_bridged_to_origin() {
    let h = start(|b| b.with(Failing)).await;

    let mut stream = TcpStream::connect(h.listening.explicit_addr()).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: example.com:{}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        h.tls_origin_port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // Upgrades skip the pipeline, so the failing middleware never runs.
    let head = tokio::time::timeout(TIMEOUT, read_head(&mut stream)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected answer: {head:?}");

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_shutdown_keeps_open_tunnels() {
    let h = start(|b| b).await;

    let tls = connect_tunnel(&h, "example.com:443").await;
    let mut sender = http_client(tls).await;

    let explicit = h.listening.explicit_addr();
    h.listening.shutdown();
    h.listening.wait().await;
    assert!(TcpStream::connect(explicit).await.is_err());

    let (status, _, _) = fetch(&mut sender, "/after-shutdown", "example.com").await;
    assert_eq!(status, StatusCode::OK);
}

/// Origin that hands back its raw request head and answers with a
/// lowercase header.
async fn spawn_raw_origin() -> (u16, tokio::sync::oneshot::Receiver<String>) {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        let _ = tx.send(head);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nx-origin-case: kept\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
    });
    (port, rx)
}

#[tokio::test]
async fn test_header_case_survives_both_directions() {
    let (origin_port, origin_head) = spawn_raw_origin().await;
    let ca = Arc::new(CertificateAuthority::generate(Subject::default(), 1).unwrap());
    let provider = Arc::new(CachingProvider::new(ca, Duration::from_secs(60)));
    let listening = Proxy::builder()
        .provider(provider)
        .forwarder(
            Forwarder::new()
                .with_ports(origin_port, 0)
                .with_resolve("example.com", IpAddr::from([127, 0, 0, 1])),
        )
        .build()
        .unwrap()
        .bind(loopback(), None)
        .await
        .unwrap();

    let mut stream = TcpStream::connect(listening.explicit_addr()).await.unwrap();
    stream
        .write_all(
            b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\nx-lower-case: v\r\nX-MiXeD: w\r\n\r\n",
        )
        .await
        .unwrap();

    let head = tokio::time::timeout(TIMEOUT, origin_head).await.unwrap().unwrap();
    assert!(head.starts_with("GET /x HTTP/1.1\r\n"), "{head:?}");
    assert!(head.contains("\r\nHost: example.com\r\n"), "{head:?}");
    assert!(head.contains("\r\nx-lower-case: v\r\n"), "{head:?}");
    assert!(head.contains("\r\nX-MiXeD: w\r\n"), "{head:?}");

    let answer = tokio::time::timeout(TIMEOUT, read_head(&mut stream)).await.unwrap();
    assert!(answer.starts_with("HTTP/1.1 200 OK\r\n"), "{answer:?}");
    assert!(answer.contains("\r\nx-origin-case: kept\r\n"), "{answer:?}");
}
