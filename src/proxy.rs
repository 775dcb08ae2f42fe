//! HTTP and HTTPS listeners
//!
//! Every request walks the same pipeline: ACME challenge, `www.` redirect,
//! auth gates, route lookup, TLS policy, then forwarding. HTTPS connections
//! pick their certificate from the SNI name before the handshake completes,
//! issuing one on demand through the [`CertificateStore`].

use crate::auth::{AuthDecision, AuthGate, SharedBasicAuth};
use crate::certs::CertificateStore;
use crate::domain::{is_local_domain, strip_port, www_redirect_target};
use crate::error::{full_body, json_error_response, not_found_response, ProxyBody, ProxyError, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::routes::{Route, RouteTable, TlsPolicy};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, SET_COOKIE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;
/// Upper bound on a backend's upgrade response head
const MAX_UPGRADE_RESPONSE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by both listeners
pub struct ProxyContext {
    pub routes: Arc<RouteTable>,
    pub certs: Arc<CertificateStore>,
    pub global_auth: Option<SharedBasicAuth>,
    pub pool: Arc<ConnectionPool>,
    /// Port used in HTTP to HTTPS redirects
    pub https_port: u16,
}

pub struct ProxyServer {
    scheme: Scheme,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(scheme: Scheme, ctx: Arc<ProxyContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            scheme,
            ctx,
            shutdown_rx,
        }
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, protocol = %self.scheme, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let scheme = self.scheme;

                            tokio::spawn(async move {
                                let result = match scheme {
                                    Scheme::Http => handle_connection(stream, addr, ctx, Scheme::Http).await,
                                    Scheme::Https => accept_tls(stream, addr, ctx).await,
                                };
                                if let Err(e) = result {
                                    debug!(addr = %addr, protocol = %scheme, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(protocol = %self.scheme, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Serves one fixed certificate for a connection whose SNI was already resolved
#[derive(Debug)]
struct ResolvedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn tls_config(key: Arc<CertifiedKey>) -> anyhow::Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ResolvedCert(key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Read the ClientHello, find the route for its SNI name and finish the
/// handshake with that route's certificate. Unknown names drop the connection.
async fn accept_tls(stream: TcpStream, addr: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

    let server_name = match start.client_hello().server_name() {
        Some(name) => name.to_ascii_lowercase(),
        None => {
            debug!(addr = %addr, "TLS handshake without SNI, dropping");
            return Ok(());
        }
    };

    let route = match ctx.routes.resolve(&server_name) {
        Some(route) => route,
        None => {
            debug!(addr = %addr, domain = %server_name, "Unknown SNI domain, dropping handshake");
            return Ok(());
        }
    };

    let key = match ctx
        .certs
        .get_secure_context(&route.domain, route.acme_email.as_deref())
        .await
    {
        Ok(key) => key,
        Err(e) => {
            warn!(domain = %route.domain, error = %e, "No certificate available, dropping handshake");
            return Ok(());
        }
    };

    let tls_stream = start.into_stream(tls_config(key)?).await?;
    handle_connection(tls_stream, addr, ctx, Scheme::Https).await
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    scheme: Scheme,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr, scheme).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
    scheme: Scheme,
) -> Result<Response<ProxyBody>, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let host = request_host(&req).unwrap_or_default();

    let result = route_request(req, &ctx, client_addr, scheme).await;
    match &result {
        Ok(response) => info!(
            method = %method,
            host = %host,
            uri = %uri,
            status = response.status().as_u16(),
            client = %client_addr.ip(),
            protocol = %scheme,
            "Request"
        ),
        Err(e) => debug!(host = %host, uri = %uri, error = %e, "Request dropped"),
    }
    result
}

async fn route_request(
    mut req: Request<Incoming>,
    ctx: &ProxyContext,
    client_addr: SocketAddr,
    scheme: Scheme,
) -> Result<Response<ProxyBody>, ProxyError> {
    // ACME challenges bypass routing and auth
    if let Some(key_auth) = ctx.certs.acme_response(req.uri().path()).await {
        debug!(path = %req.uri().path(), "Responding to ACME HTTP-01 challenge");
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(full_body(key_auth))
            .expect("valid response builder"));
    }

    let raw_host = match request_host(&req) {
        Some(host) => host,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };
    let hostname = strip_port(&raw_host).to_string();
    let path = path_and_query(&req);

    if let Some(target) = www_redirect_target(&raw_host) {
        return Ok(redirect_response(format!("{}://{}{}", scheme, target, path)));
    }

    let upgrade = is_upgrade_request(&req);
    let route = ctx.routes.resolve(&hostname);

    let set_cookie = match authorize(ctx, &hostname, route.as_deref(), req.headers()) {
        AuthDecision::Continue { set_cookie } => set_cookie,
        AuthDecision::Respond(_) if upgrade => {
            return Err(ProxyError::UpgradeDropped(hostname));
        }
        AuthDecision::Respond(response) => return Ok(response),
    };

    let route = match route {
        Some(route) => route,
        None if upgrade => return Err(ProxyError::UpgradeDropped(hostname)),
        None => {
            debug!(hostname, "No route for host");
            return Ok(with_cookie(not_found_response(), set_cookie));
        }
    };

    match (scheme, route.tls_policy) {
        (Scheme::Http, TlsPolicy::NoHttp) | (Scheme::Https, TlsPolicy::NoHttps) => {
            debug!(hostname, policy = %route.tls_policy, protocol = %scheme, "Protocol not allowed by route");
            return Ok(with_cookie(not_found_response(), set_cookie));
        }
        (Scheme::Http, TlsPolicy::Redirect) => {
            let location = https_location(&hostname, ctx.https_port, &path);
            return Ok(with_cookie(redirect_response(location), set_cookie));
        }
        _ => {}
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    set_forwarding_headers(req.headers_mut(), &request_id, client_addr, &raw_host, scheme);

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, backend = %route.backend, "Forwarding request");

    if upgrade {
        let response = handle_upgrade(req, &route, request_id).await;
        return Ok(with_cookie(response, set_cookie));
    }

    match ctx.pool.send_request(req, route.backend).await {
        Ok(response) => Ok(with_cookie(response, set_cookie)),
        Err(e) => {
            error!(hostname, backend = %route.backend, error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Global gate first, then the route's own gate. Local hosts are never gated.
fn authorize(ctx: &ProxyContext, hostname: &str, route: Option<&Route>, headers: &HeaderMap) -> AuthDecision {
    if is_local_domain(hostname) {
        return AuthDecision::Continue { set_cookie: None };
    }

    if let Some(global) = &ctx.global_auth {
        if !global.is_authorized(headers) {
            return global.challenge(hostname, headers);
        }
    }

    if let Some(auth) = route.and_then(|r| r.auth.as_ref()) {
        if !auth.is_authorized(headers) {
            return auth.challenge(hostname, headers);
        }
    }

    AuthDecision::Continue { set_cookie: None }
}

/// Overwrite client-supplied forwarding headers; this proxy is the first hop.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    request_id: &str,
    client_addr: SocketAddr,
    host: &str,
    scheme: Scheme,
) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
}

fn with_cookie(mut response: Response<ProxyBody>, cookie: Option<HeaderValue>) -> Response<ProxyBody> {
    if let Some(cookie) = cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Host from the `Host` header, or the URI authority for HTTP/2
fn request_host(req: &Request<Incoming>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    validate_host(host)
}

fn validate_host(host: &str) -> Option<String> {
    let host = host.trim();
    let hostname = strip_port(host);
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    // hostname characters (underscores included) and IPv6 literal brackets
    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '[' | ']'));
    valid.then(|| host.to_ascii_lowercase())
}

fn path_and_query<B>(req: &Request<B>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn https_location(hostname: &str, https_port: u16, path: &str) -> String {
    if https_port == 443 {
        format!("https://{}{}", hostname, path)
    } else {
        format!("https://{}:{}{}", hostname, https_port, path)
    }
}

/// 301 Moved Permanently
fn redirect_response(location: String) -> Response<ProxyBody> {
    debug!(location, "Redirecting");
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Moved Permanently"))
        .expect("valid response builder")
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Raw HTTP/1.1 upgrade request for the backend, Host header preserved
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query(req));

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if !req.headers().contains_key(hyper::header::HOST) {
        if let Some(authority) = req.uri().authority() {
            request.push_str(&format!("host: {}\r\n", authority));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the backend's response head. Returns the status, headers and the
/// offset where the upgraded byte stream begins.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, usize)> {
    let head_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers, head_end))
}

async fn read_upgrade_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_UPGRADE_RESPONSE {
            return Ok(buf);
        }
    }
}

/// Relay an upgrade to the route's backend and splice the two sockets
async fn handle_upgrade(req: Request<Incoming>, route: &Route, request_id: String) -> Response<ProxyBody> {
    let hostname = route.domain.clone();
    let backend = route.backend;

    let mut backend_stream = match TcpStream::connect(backend).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(hostname, backend = %backend, error = %e, "Failed to connect to backend for upgrade");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        }
    };

    if let Err(e) = backend_stream.write_all(&build_upgrade_request(&req)).await {
        error!(hostname, error = %e, "Failed to send upgrade request to backend");
        return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to send upgrade request");
    }

    let head = match read_upgrade_head(&mut backend_stream).await {
        Ok(head) => head,
        Err(e) => {
            error!(hostname, error = %e, "Failed to read upgrade response from backend");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Backend closed connection");
        }
    };

    let (status, response_headers, body_start) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(hostname, "Failed to parse backend upgrade response");
            return json_error_response(ProxyErrorCode::UpgradeRejected, "Invalid upgrade response from backend");
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        let name_lower = name.to_ascii_lowercase();
        if status == StatusCode::SWITCHING_PROTOCOLS
            && (name_lower == "content-length" || name_lower == "transfer-encoding")
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response.body(empty_body()).expect("valid response builder");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %status, "Backend rejected upgrade request");
        return response;
    }

    info!(hostname, request_id, backend = %backend, "WebSocket upgrade successful");

    let leftover = head[body_start..].to_vec();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, leftover, &hostname, &request_id).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    hostname: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(hostname, request_id, error = %e, "WebSocket client went away");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_backend,
                backend_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}
