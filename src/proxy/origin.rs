use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, Uri};
use rustls::crypto::ring;
use rustls::pki_types::ServerName;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, warn};

use crate::proxy::http::BodyPlan;

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

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The configured origin base URL, e.g. `https://example.com:8443/mirror`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
    /// Path prefix without a trailing slash; empty for the site root.
    base_path: String,
}

impl Origin {
    pub fn parse(value: &str) -> Result<Self> {
        let uri: Uri = value
            .trim()
            .parse()
            .with_context(|| format!("invalid origin URL '{value}'"))?;
        let scheme = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(other) => bail!("unsupported origin scheme '{other}'"),
            None => bail!("origin URL '{value}' must start with http:// or https://"),
        };
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("origin URL '{value}' is missing a host"))?
            .to_string();
        ensure!(
            uri.query().is_none(),
            "origin URL '{value}' must not carry a query string"
        );
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        let base_path = uri.path().trim_end_matches('/').to_string();
        Ok(Self {
            scheme,
            host,
            port,
            base_path,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host` or `host:port` when the port is not the scheme default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the `Origin` header: scheme and authority.
    pub fn origin_value(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    /// Request target sent on the origin request line.
    pub fn request_target(&self, path: &str, query: &str) -> String {
        let mut target = format!("{}{}", self.base_path, path);
        if !target.starts_with('/') {
            target.insert(0, '/');
        }
        if !query.is_empty() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    /// Absolute URL of a forwarded request, for logs.
    pub fn url(&self, path: &str, query: &str) -> String {
        format!("{}{}", self.origin_value(), self.request_target(path, query))
    }

    /// Keeps the path and query of a `Referer` and swaps its scheme and host for the origin.
    pub fn rewrite_referer(&self, referer: &str) -> Option<String> {
        let uri: Uri = referer.parse().ok()?;
        let path_and_query = uri.path_and_query()?;
        Some(self.url(path_and_query.path(), path_and_query.query().unwrap_or_default()))
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.origin_value(), self.base_path)
    }
}

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens one connection per forwarded request. No timeout is imposed on the origin.
pub struct OriginClient {
    origin: Origin,
    tls: Option<TlsConnector>,
}

impl OriginClient {
    pub fn new(origin: Origin) -> Result<Self> {
        let tls = match origin.scheme() {
            Scheme::Https => Some(TlsConnector::from(build_tls_client_config()?)),
            Scheme::Http => None,
        };
        Ok(Self { origin, tls })
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub(crate) async fn connect(&self) -> Result<(UpstreamIo, SocketAddr)> {
        let addr = (self.origin.host(), self.origin.port());
        let stream = TcpStream::connect(addr).await.with_context(|| {
            format!(
                "failed to connect to origin {}:{}",
                self.origin.host(),
                self.origin.port()
            )
        })?;
        let peer = stream.peer_addr().context("reading origin peer address")?;
        let _ = stream.set_nodelay(true);
        debug!(origin = %self.origin, peer = %peer, "connected to origin");

        let Some(connector) = self.tls.as_ref() else {
            return Ok((UpstreamIo::Plain(stream), peer));
        };
        let server_name = ServerName::try_from(self.origin.host().to_string())
            .map_err(|_| anyhow!("invalid origin host for TLS '{}'", self.origin.host()))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .with_context(|| format!("failed to establish TLS with origin {}", self.origin))?;
        Ok((UpstreamIo::Tls(Box::new(tls)), peer))
    }
}

/// Writes the request line and headers. Framing follows `body_plan`: a chunked inbound body
/// is re-chunked, a fixed one keeps its length.
pub(crate) async fn send_request_head<W>(
    writer: &mut W,
    method: &Method,
    target: &str,
    headers: &HeaderMap,
    body_plan: BodyPlan,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::with_capacity(512);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    match body_plan {
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        BodyPlan::Chunked => buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
        BodyPlan::Empty if *method == Method::POST || *method == Method::PUT => {
            buffer.extend_from_slice(b"Content-Length: 0\r\n");
        }
        BodyPlan::Empty | BodyPlan::UntilClose => {}
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    writer
        .write_all(&buffer)
        .await
        .context("writing request head to origin")
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            ensure!(
                added > 0,
                "no trust anchors loaded from system locations; cannot verify the origin"
            );
        }
        Err(err) => bail!("failed to load system trust anchors: {err}"),
    }

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
