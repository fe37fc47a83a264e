use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use webshare::{
    cli::LogFormat,
    proxy::{self, AppContext},
    settings::{Mode, Settings},
};

use super::http_utils::{HttpResponse, send_request};

/// A server bound to an ephemeral loopback port, serving from a temporary root.
pub struct ServerHarness {
    _root: TempDir,
    pub root: PathBuf,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    handle: JoinHandle<()>,
}

impl ServerHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub async fn request(&self, raw: &str) -> Result<HttpResponse> {
        send_request(self.addr, raw.as_bytes()).await
    }

    pub async fn get(&self, target: &str) -> Result<HttpResponse> {
        self.request(&format!(
            "GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n"
        ))
        .await
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn write_file(&self, relative: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct ServerHarnessBuilder {
    root: TempDir,
    files: Vec<(String, Vec<u8>)>,
    overrides: Vec<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ServerHarnessBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: TempDir::new()?,
            files: Vec::new(),
            overrides: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn with_file(mut self, relative: &str, contents: impl AsRef<[u8]>) -> Self {
        self.files
            .push((relative.to_string(), contents.as_ref().to_vec()));
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.overrides.push(Box::new(func));
        self
    }

    /// Proxy mode with caching enabled, forwarding misses to `origin`.
    pub fn writable_proxy(self, origin: SocketAddr) -> Self {
        self.with_settings(move |settings| {
            settings.mode = Mode::Proxy;
            settings.origin = Some(format!("http://{origin}"));
            settings.read_only = false;
        })
    }

    pub async fn spawn(mut self) -> Result<ServerHarness> {
        let root = self.root.path().to_path_buf();
        for (relative, contents) in &self.files {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let mut settings = Settings::for_root(&root);
        settings.listen = addr;
        settings.log = LogFormat::Text;
        settings.client_timeout = 5;
        for override_fn in self.overrides.drain(..) {
            override_fn(&mut settings);
        }
        settings.validate()?;
        let settings = Arc::new(settings);

        let app = AppContext::from_settings(settings.clone())?;
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::run_on(listener, app).await {
                tracing::error!(error = ?err, "server run failed");
            }
        });

        Ok(ServerHarness {
            _root: self.root,
            root,
            addr,
            settings,
            handle,
        })
    }
}
