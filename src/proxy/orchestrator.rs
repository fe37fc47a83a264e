use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::auth::Authenticator;
use crate::io_util::{Destination, FailurePolicy, Sink, TeeWriter};
use crate::metrics;
use crate::mime::MimeTypes;
use crate::proxy::cache::{self, CacheFile, CacheKeyer, CacheRoot, Lookup, needs_key};
use crate::proxy::error::ProxyError;
use crate::proxy::handler::{Exchange, Request, RequestHandler, serve_local};
use crate::proxy::headers::{HeaderRemapper, is_hop_by_hop};
use crate::proxy::http::{
    BodyPlan, BodyReader, ResponseHead, copy_body, finish_chunks, read_response_head,
    write_chunk,
};
use crate::proxy::origin::{OriginClient, send_request_head};

/// Origin side of the caching proxy: where to fetch from and how to rewrite headers.
pub struct Upstream {
    pub client: OriginClient,
    pub remapper: HeaderRemapper,
}

pub struct ProxyOptions {
    pub read_only: bool,
    pub chunk_size: usize,
    pub client_timeout: Duration,
    pub max_request_body_size: u64,
    pub max_header_size: usize,
}

/// Serves local files when present and otherwise forwards to the origin, writing
/// cacheable responses through to disk while they stream to the client.
pub struct CachingProxy {
    root: CacheRoot,
    upstream: Option<Upstream>,
    mime: MimeTypes,
    auth: Authenticator,
    options: ProxyOptions,
}

/// Whether an origin response may become a cache file. Partial content never does.
pub fn is_cacheable(read_only: bool, status: StatusCode) -> bool {
    !read_only
        && status.as_u16() < 300
        && status != StatusCode::NOT_MODIFIED
        && status != StatusCode::PARTIAL_CONTENT
}

impl CachingProxy {
    pub fn new(
        root: CacheRoot,
        upstream: Option<Upstream>,
        mime: MimeTypes,
        auth: Authenticator,
        options: ProxyOptions,
    ) -> Self {
        Self {
            root,
            upstream,
            mime,
            auth,
            options,
        }
    }

    async fn forward(
        &self,
        upstream: &Upstream,
        request: &Request,
        lookup: &Lookup,
        exchange: &mut Exchange,
    ) -> Result<StatusCode> {
        let origin = upstream.client.origin();
        let url = origin.url(&request.raw_path, &request.query);
        let (stream, origin_addr) = upstream
            .client
            .connect()
            .await
            .map_err(|err| ProxyError::upstream(&url, err))?;
        metrics::record_origin_request(&request.method);
        debug!(url = %url, origin = %origin_addr, "forwarding request to origin");

        let (origin_read, mut origin_write) = tokio::io::split(stream);
        let outbound = upstream.remapper.remap(&request.headers);
        let target = origin.request_target(&request.raw_path, &request.query);
        send_request_head(
            &mut origin_write,
            &request.method,
            &target,
            &outbound,
            request.body,
        )
        .await
        .map_err(|err| ProxyError::upstream(&url, err))?;

        let keyer = self
            .forward_body(request, exchange, &mut origin_write)
            .await
            .map_err(|err| upstream_unless_typed(&url, err))?;

        let mut origin_reader = BufReader::new(origin_read);
        let head = read_final_head(&mut origin_reader, origin_addr, self.options.max_header_size)
            .await
            .map_err(|err| ProxyError::upstream(&url, err))?;
        let status = head.status;
        let plan = BodyPlan::for_response(&request.method, &head);
        debug!(url = %url, status = status.as_u16(), body = ?plan, "origin responded");

        let cacheable = is_cacheable(self.options.read_only, status)
            && request.method != Method::HEAD;
        let client_headers = self.client_headers(&head, lookup, plan);
        let mut body = BodyReader::new(&mut origin_reader, plan, origin_addr, None);

        if !cacheable {
            exchange.cache = Some(if self.options.read_only {
                "bypassed"
            } else {
                "skipped"
            });
            exchange.client.send_head(status, &client_headers).await?;
            let mut client =
                Destination::new("client", &mut exchange.client, FailurePolicy::Propagate);
            copy_body(&mut body, &mut client, self.options.chunk_size)
                .await
                .with_context(|| format!("streaming origin body for {url}"))?;
            return Ok(status);
        }

        let path = if needs_key(&request.method, &request.query) {
            keyer.keyed_path(&self.root, &request.method, &request.path)
        } else {
            lookup.direct.clone()
        };
        exchange.target = Some(path.clone());
        let mut file = match CacheFile::create(&path).await {
            Ok(file) => file,
            Err(err) => {
                metrics::record_cache_store_error();
                return Err(err.into());
            }
        };

        exchange.cache = Some("stored");
        let head_failure = match exchange.client.send_head(status, &client_headers).await {
            Ok(()) => None,
            Err(err) => {
                debug!(url = %url, error = %err, "client went away before the response head");
                Some(client_error_kind(&err))
            }
        };
        let client_failure = {
            let mut tee = TeeWriter::new(
                Destination::new("cache", &mut file, FailurePolicy::Propagate),
                Destination::new("client", &mut exchange.client, FailurePolicy::Ignore)
                    .with_failure(head_failure),
            );
            let copied = copy_body(&mut body, &mut tee, self.options.chunk_size).await;
            let closed = tee.close().await;
            let client_failure = tee.second().failure();
            if let Err(err) = copied {
                metrics::record_cache_store_error();
                return Err(err.context(format!("streaming origin body for {url}")));
            }
            closed.map_err(|err| ProxyError::cache_write(&path, err))?;
            client_failure
        };

        let stored = match file.commit().await {
            Ok(stored) => stored,
            Err(err) => {
                metrics::record_cache_store_error();
                return Err(err.into());
            }
        };
        metrics::record_cache_store();
        if let Some(kind) = client_failure {
            info!(
                path = %stored.display(),
                error_kind = ?kind,
                "client went away during transfer; cache file completed"
            );
        }
        Ok(status)
    }

    /// Streams the request body to the origin, feeding the cache key as bytes pass.
    async fn forward_body<W>(
        &self,
        request: &Request,
        exchange: &mut Exchange,
        origin: &mut W,
    ) -> Result<CacheKeyer>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut keyer = CacheKeyer::new(&request.query);
        exchange.unread_body = BodyPlan::Empty;
        if request.body.is_empty() {
            origin.flush().await.context("flushing request to origin")?;
            return Ok(keyer);
        }

        let mut body = BodyReader::new(
            &mut exchange.reader,
            request.body,
            request.peer,
            Some(self.options.client_timeout),
        );
        if request.body == BodyPlan::Chunked {
            body = body.with_limit(self.options.max_request_body_size);
        }
        let chunked = request.body == BodyPlan::Chunked;
        let mut sink = KeyedForward {
            keyer: &mut keyer,
            writer: origin,
            chunked,
        };
        let sent = copy_body(&mut body, &mut sink, self.options.chunk_size).await?;
        if chunked {
            finish_chunks(&mut *sink.writer)
                .await
                .context("finishing chunked request body")?;
        }
        sink.writer
            .flush()
            .await
            .context("flushing request to origin")?;
        debug!(
            bytes = sent,
            checksum = %format!("{:08x}", keyer.checksum()),
            "request body forwarded"
        );
        Ok(keyer)
    }

    /// Origin headers minus framing, with our own content type and length.
    fn client_headers(&self, head: &ResponseHead, lookup: &Lookup, plan: BodyPlan) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &head.headers {
            if is_hop_by_hop(name.as_str()) || name == header::CONTENT_TYPE {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Ok(value) = HeaderValue::from_str(&self.mime.content_type(&lookup.direct)) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        match plan {
            BodyPlan::Fixed(length) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            }
            BodyPlan::Empty => {
                if let Some(length) = head.content_length {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                } else if !head.status.is_informational()
                    && head.status != StatusCode::NO_CONTENT
                    && head.status != StatusCode::NOT_MODIFIED
                {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
                }
            }
            BodyPlan::Chunked | BodyPlan::UntilClose => {}
        }
        headers
    }
}

#[async_trait]
impl RequestHandler for CachingProxy {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    async fn resolve(&self, request: &Request) -> Result<Lookup> {
        let lookup = cache::lookup(
            &self.root,
            &request.method,
            &request.path,
            &request.query,
            !request.body.is_empty(),
        )
        .await;
        metrics::record_cache_lookup(lookup.hit.is_some());
        Ok(lookup)
    }

    async fn respond(
        &self,
        request: &Request,
        lookup: Lookup,
        exchange: &mut Exchange,
    ) -> Result<StatusCode> {
        if let Some(file) = &lookup.hit {
            return serve_local(
                request,
                &lookup,
                file,
                &self.mime,
                None,
                self.options.chunk_size,
                exchange,
            )
            .await;
        }

        let Some(upstream) = &self.upstream else {
            exchange.cache = Some("miss");
            exchange.target = Some(lookup.direct.clone());
            exchange
                .client
                .send_text(StatusCode::NOT_FOUND, "Not found")
                .await?;
            return Ok(StatusCode::NOT_FOUND);
        };
        exchange.cache = Some("miss");
        self.forward(upstream, request, &lookup, exchange).await
    }
}

/// Skips interim 1xx responses.
async fn read_final_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    max_header_size: usize,
) -> Result<ResponseHead>
where
    S: tokio::io::AsyncRead + Unpin,
{
    loop {
        let head = read_response_head(reader, peer, max_header_size).await?;
        if head.status.is_informational() {
            debug!(status = head.status.as_u16(), "skipping interim origin response");
            continue;
        }
        return Ok(head);
    }
}

fn client_error_kind(err: &anyhow::Error) -> io::ErrorKind {
    match err.downcast_ref::<ProxyError>() {
        Some(ProxyError::ClientDisconnect { source }) => source.kind(),
        _ => io::ErrorKind::Other,
    }
}

fn upstream_unless_typed(url: &str, err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<ProxyError>().is_some() {
        err
    } else {
        ProxyError::upstream(url, err).into()
    }
}

/// Forwarding sink: bytes reach the origin (re-chunked when the client sent chunks) and
/// update the cache key in the same order.
struct KeyedForward<'a, W> {
    keyer: &'a mut CacheKeyer,
    writer: &'a mut W,
    chunked: bool,
}

#[async_trait]
impl<W> Sink for KeyedForward<'_, W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.keyer.update(buf);
        if self.chunked {
            write_chunk(&mut *self.writer, buf).await
        } else {
            self.writer.write_all(buf).await
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
