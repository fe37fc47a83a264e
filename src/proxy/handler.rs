use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::auth::Authenticator;
use crate::mime::MimeTypes;
use crate::proxy::cache::{LocalFile, Lookup, RequestPath};
use crate::proxy::http::{BodyPlan, ClientSink};
use crate::proxy::range::{FileResponse, serve_file};

pub type ClientReader = BufReader<Box<dyn AsyncRead + Unpin + Send>>;
pub type ClientWriter = ClientSink<Box<dyn AsyncWrite + Unpin + Send>>;

/// A parsed inbound request. The body is still unread on the connection.
#[derive(Debug)]
pub struct Request {
    pub peer: SocketAddr,
    pub method: Method,
    /// Path as sent by the client, still percent-encoded.
    pub raw_path: String,
    pub path: RequestPath,
    pub query: String,
    pub headers: HeaderMap,
    pub body: BodyPlan,
    /// Decoded query parameters a handler chose to keep.
    pub params: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Both halves of the client connection plus what the handler has learned so far, so the
/// access log can report it even when the handler fails.
pub struct Exchange {
    pub reader: ClientReader,
    pub client: ClientWriter,
    pub cache: Option<&'static str>,
    pub target: Option<PathBuf>,
    /// Request body still waiting on the connection; cleared once a handler reads it.
    pub unread_body: BodyPlan,
}

impl Exchange {
    pub fn new(reader: ClientReader, client: ClientWriter) -> Self {
        Self {
            reader,
            client,
            cache: None,
            target: None,
            unread_body: BodyPlan::Empty,
        }
    }
}

/// Per-mode request behaviour. The connection loop parses the request, then calls
/// `authenticate`, `handle_param` for each decoded query pair, `resolve` and `respond`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn authenticator(&self) -> &Authenticator;

    fn authenticate(&self, request: &Request) -> bool {
        self.authenticator()
            .check(request.peer.ip(), &request.headers)
    }

    fn handle_param(&self, _request: &mut Request, _name: &str, _value: &str) {}

    /// Finds a local file for the request; `Lookup::hit` is `None` on a miss.
    async fn resolve(&self, request: &Request) -> Result<Lookup>;

    async fn respond(
        &self,
        request: &Request,
        lookup: Lookup,
        exchange: &mut Exchange,
    ) -> Result<StatusCode>;
}

/// Serves a file found by `resolve`, with `Range` support. The content type comes from
/// the direct candidate's name so keyed cache files keep the type of the resource.
pub(crate) async fn serve_local(
    request: &Request,
    lookup: &Lookup,
    file: &LocalFile,
    mime: &MimeTypes,
    attachment: Option<&str>,
    chunk_size: usize,
    exchange: &mut Exchange,
) -> Result<StatusCode> {
    exchange.cache = Some(file.kind.as_str());
    exchange.target = Some(file.path.clone());
    let content_type = mime.content_type(&lookup.direct);
    serve_file(
        &mut exchange.client,
        &request.method,
        request.header(header::RANGE),
        FileResponse {
            path: &file.path,
            len: file.metadata.len(),
            modified: file.metadata.modified().ok(),
            content_type: &content_type,
            attachment,
        },
        chunk_size,
    )
    .await
}
