//! Per-request state handed through the middleware pipeline.

use super::error::ProxyError;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::http::Extensions;
use hyper::{Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use tracing::error;

/// Body type used for requests and responses inside the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// How the request reached the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Plain HTTP on the explicit proxy listener.
    Plain,
    /// Decrypted from an intercepted TLS connection.
    Tls,
}

impl Transport {
    /// URI scheme matching the transport.
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::Tls => "https",
        }
    }
}

/// Request context.
///
/// Created fresh for every request and dropped once the response has been
/// handed back to the connection.
pub struct Context {
    request: Parts,
    body: Option<ProxyBody>,
    response: Option<Response<ProxyBody>>,
    path: String,
    absolute_form: bool,
    transport: Transport,
    remote_addr: SocketAddr,
    state: Extensions,
}

impl Context {
    /// Build a context for an inbound request.
    pub fn new(req: Request<Incoming>, transport: Transport, remote_addr: SocketAddr) -> Self {
        let (parts, body) = req.into_parts();
        Self::from_parts(parts, body.boxed(), transport, remote_addr)
    }

    /// Build a context from an already split request.
    pub fn from_parts(
        request: Parts,
        body: ProxyBody,
        transport: Transport,
        remote_addr: SocketAddr,
    ) -> Self {
        let absolute_form = !request.uri.to_string().starts_with('/');
        let path = resolve_path(&request.uri);
        Self {
            request,
            body: Some(body),
            response: None,
            path,
            absolute_form,
            transport,
            remote_addr,
            state: Extensions::new(),
        }
    }

    /// The inbound request head.
    pub fn request(&self) -> &Parts {
        &self.request
    }

    /// Mutable access to the inbound request head.
    pub fn request_mut(&mut self) -> &mut Parts {
        &mut self.request
    }

    /// Take the inbound body, leaving nothing behind.
    pub fn take_body(&mut self) -> Option<ProxyBody> {
        self.body.take()
    }

    /// Replace the inbound body.
    pub fn set_body(&mut self, body: ProxyBody) {
        self.body = Some(body);
    }

    /// Path the request is forwarded to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the request target was in absolute form (`http://host/..`).
    pub fn is_absolute_form(&self) -> bool {
        self.absolute_form
    }

    /// How the request reached the proxy.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Address of the original client.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The response picked so far, if any.
    pub fn response(&self) -> Option<&Response<ProxyBody>> {
        self.response.as_ref()
    }

    /// Mutable access to the response picked so far.
    pub fn response_mut(&mut self) -> Option<&mut Response<ProxyBody>> {
        self.response.as_mut()
    }

    /// Set the response sent back to the client.
    pub fn respond(&mut self, response: Response<ProxyBody>) {
        self.response = Some(response);
    }

    /// Typed per-request state shared between middleware.
    pub fn state(&self) -> &Extensions {
        &self.state
    }

    /// Mutable per-request state.
    pub fn state_mut(&mut self) -> &mut Extensions {
        &mut self.state
    }

    /// Error handler for failures that escaped the pipeline.
    ///
    /// Logs the failure and replaces the response with a bare 500.
    pub fn on_error(&mut self, err: &ProxyError) {
        error!(
            "{} {} from {} failed: {}",
            self.request.method, self.request.uri, self.remote_addr, err
        );
        self.response = Some(status_response(StatusCode::INTERNAL_SERVER_ERROR));
    }

    /// Consume the context, yielding the response for the client.
    ///
    /// A chain that finished without responding yields 404.
    pub fn into_response(self) -> Response<ProxyBody> {
        self.response
            .unwrap_or_else(|| status_response(StatusCode::NOT_FOUND))
    }
}

/// Path a request target resolves to.
///
/// Origin-form targets are kept verbatim. Absolute-form targets keep only
/// their path component.
pub fn resolve_path(uri: &Uri) -> String {
    let target = uri.to_string();
    if target.starts_with('/') {
        return target;
    }
    match uri.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    }
}

/// Create an empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Response carrying only a status and its canonical reason as body.
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut response = Response::new(full_body(reason));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}
