use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};

use crate::auth::Authenticator;
use crate::mime::MimeTypes;
use crate::proxy::cache::{CacheRoot, HitKind, LocalFile, Lookup, find_direct};
use crate::proxy::handler::{Exchange, Request, RequestHandler, serve_local};

const DOWNLOAD_PARAM: &str = "download";

/// Plain file share: GET and HEAD serve files below the root, nothing is fetched.
pub struct FileShare {
    root: CacheRoot,
    mime: MimeTypes,
    auth: Authenticator,
    chunk_size: usize,
}

impl FileShare {
    pub fn new(root: CacheRoot, mime: MimeTypes, auth: Authenticator, chunk_size: usize) -> Self {
        Self {
            root,
            mime,
            auth,
            chunk_size,
        }
    }
}

#[async_trait]
impl RequestHandler for FileShare {
    fn name(&self) -> &'static str {
        "share"
    }

    fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    fn handle_param(&self, request: &mut Request, name: &str, value: &str) {
        if name == DOWNLOAD_PARAM {
            request.params.insert(name.to_string(), value.to_string());
        }
    }

    async fn resolve(&self, request: &Request) -> Result<Lookup> {
        // Directories resolve to their index.html whatever the method.
        let (direct, found) = find_direct(&self.root, &Method::GET, &request.path).await;
        let hit = found.map(|metadata| LocalFile {
            path: direct.clone(),
            kind: HitKind::Direct,
            metadata,
        });
        Ok(Lookup { direct, hit })
    }

    async fn respond(
        &self,
        request: &Request,
        lookup: Lookup,
        exchange: &mut Exchange,
    ) -> Result<StatusCode> {
        if request.method != Method::GET && request.method != Method::HEAD {
            let mut headers = HeaderMap::new();
            headers.insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            exchange
                .client
                .send_text_with(StatusCode::METHOD_NOT_ALLOWED, headers, "Method not allowed")
                .await?;
            return Ok(StatusCode::METHOD_NOT_ALLOWED);
        }

        let favicon = request.path.to_string() == "/favicon.ico";
        let Some(file) = lookup.hit.as_ref().filter(|_| !favicon) else {
            exchange.cache = Some("miss");
            exchange.target = Some(lookup.direct.clone());
            exchange
                .client
                .send_text(StatusCode::NOT_FOUND, "Not found")
                .await?;
            return Ok(StatusCode::NOT_FOUND);
        };

        let attachment = if request.params.contains_key(DOWNLOAD_PARAM) {
            file.path.file_name().and_then(|name| name.to_str())
        } else {
            None
        };
        serve_local(
            request,
            &lookup,
            file,
            &self.mime,
            attachment,
            self.chunk_size,
            exchange,
        )
        .await
    }
}
