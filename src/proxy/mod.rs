pub mod cache;
pub mod error;
pub mod handler;
pub mod headers;
pub mod http;
pub mod limits;
pub mod listener;
pub mod orchestrator;
pub mod origin;
pub mod range;
pub mod share;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::auth::Authenticator;
use crate::mime::MimeTypes;
use crate::settings::{Mode, Settings};
use cache::CacheRoot;
use handler::RequestHandler;
use headers::HeaderRemapper;
use orchestrator::{CachingProxy, ProxyOptions, Upstream};
use origin::{Origin, OriginClient};
use share::FileShare;

/// Everything a connection worker needs, built once per server instance.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub handler: Arc<dyn RequestHandler>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { settings, handler }
    }

    pub fn from_settings(settings: Arc<Settings>) -> Result<Self> {
        let handler = build_handler(&settings)?;
        Ok(Self::new(settings, handler))
    }
}

fn build_handler(settings: &Settings) -> Result<Arc<dyn RequestHandler>> {
    let root = CacheRoot::new(&settings.root);
    let mime = MimeTypes::load(settings.mime_map.as_deref())?;
    let auth = Authenticator::new(settings.auth.clone());

    match settings.mode {
        Mode::Share => Ok(Arc::new(FileShare::new(
            root,
            mime,
            auth,
            settings.copy_chunk_size,
        ))),
        Mode::Proxy => {
            let upstream = match settings.origin.as_deref() {
                Some(url) => {
                    let origin = Origin::parse(url)?;
                    let remapper =
                        HeaderRemapper::for_origin(origin.clone(), &settings.header_rules)
                            .context("invalid header_rules")?;
                    Some(Upstream {
                        client: OriginClient::new(origin)?,
                        remapper,
                    })
                }
                None => None,
            };
            let options = ProxyOptions {
                read_only: settings.read_only,
                chunk_size: settings.copy_chunk_size,
                client_timeout: settings.client_timeout(),
                max_request_body_size: settings.max_request_body_size,
                max_header_size: settings.max_header_size,
            };
            Ok(Arc::new(CachingProxy::new(root, upstream, mime, auth, options)))
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    let listener = listener::bind(app.settings.listen).await?;
    listener::serve(listener, app).await
}

/// Serves on an already bound listener; used when the caller needs the bound address.
pub async fn run_on(listener: TcpListener, app: AppContext) -> Result<()> {
    listener::serve(listener, app).await
}
