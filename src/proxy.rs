//! Proxy server implementation
//! Terminates TLS and forwards every request, plaintext, to a single upstream

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, TE, UPGRADE};
use hyper::http::uri::{Authority, Scheme};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Header telling the upstream which scheme the client used
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Proxy server
pub struct ProxyServer {
    upstream: Authority,
    acceptor: TlsAcceptor,
    client: Client<HttpConnector, Incoming>,
}

impl ProxyServer {
    /// Create a proxy forwarding to `upstream` (host:port). An empty host,
    /// as in `:9000`, means the local machine.
    pub fn new(upstream: &str, acceptor: TlsAcceptor) -> Result<Self> {
        let upstream = parse_upstream(upstream)?;
        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            upstream,
            acceptor,
            client,
        })
    }

    /// Bind `addr` and serve until the process is killed
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("HTTPS server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await.context("Accept failed")?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("Connection error from {}: {:#}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single TLS connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .context("TLS handshake error")?;
        let io = TokioIo::new(tls_stream);

        auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        debug!("{} {} from {}", req.method(), req.uri(), remote_addr);

        match self.proxy_request(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Proxy error: {:#}", e);
                Ok(Self::error_response(StatusCode::BAD_GATEWAY))
            }
        }
    }

    /// Forward the request upstream and relay the response
    async fn proxy_request(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        remove_hop_headers(req.headers_mut());
        if let Some(protocol) = upgrade {
            req.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            req.headers_mut().insert(UPGRADE, protocol);
        }
        rewrite_request(&mut req, &self.upstream)?;

        let mut response = self
            .client
            .request(req)
            .await
            .context("Upstream request failed")?;

        match client_upgrade {
            Some(client_upgrade) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(async move {
                    if let Err(e) = tunnel(client_upgrade, upstream_upgrade).await {
                        debug!("Upgraded connection error: {:#}", e);
                    }
                });
            }
            _ => remove_hop_headers(response.headers_mut()),
        }

        Ok(response.map(|body| body.boxed()))
    }

    /// Create error response
    fn error_response(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(Self::empty_body());
        *response.status_mut() = status;
        response
    }

    /// Create empty body
    fn empty_body() -> ProxyBody {
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed()
    }
}

/// Parse the upstream authority, dialing 127.0.0.1 when the host is empty
fn parse_upstream(upstream: &str) -> Result<Authority> {
    let authority: Authority = upstream
        .parse()
        .with_context(|| format!("Invalid upstream address: {}", upstream))?;
    if !authority.host().is_empty() {
        return Ok(authority);
    }

    format!("127.0.0.1{}", authority.as_str())
        .parse()
        .with_context(|| format!("Invalid upstream address: {}", upstream))
}

/// Point the request at the upstream over plain HTTP and mark it as
/// originally HTTPS. Path, query, method, body and other headers are kept.
pub fn rewrite_request<B>(req: &mut Request<B>, upstream: &Authority) -> Result<()> {
    if !req.headers().contains_key(HOST) {
        // HTTP/2 clients send the authority in the URI only
        if let Some(authority) = req.uri().authority() {
            let host = HeaderValue::from_str(authority.as_str())?;
            req.headers_mut().insert(HOST, host);
        }
    }

    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(upstream.clone());
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse()?);
    }
    *req.uri_mut() = Uri::from_parts(parts)?;
    *req.version_mut() = Version::HTTP_11;

    req.headers_mut()
        .insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    Ok(())
}

/// Strip hop-by-hop headers, including any named by `Connection`.
/// `TE: trailers` survives since it is meaningful end to end.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let wants_trailers = headers.get_all(TE).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")))
            .unwrap_or(false)
    });

    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    if wants_trailers {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }
}

/// Protocol requested through `Connection: upgrade` + `Upgrade`
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if requested {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Splice two upgraded connections together until either side closes
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) -> Result<()> {
    let (client, upstream) = tokio::try_join!(client, upstream)?;
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!("Upgraded connection closed ({} bytes up, {} bytes down)", sent, received);
    Ok(())
}
