use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use super::{AppContext, http};

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))
}

/// Accepts connections forever. At most `workers` requests are served at once; further
/// connections wait in the accept backlog until a worker frees up.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener.local_addr().context("reading listener address")?;
    let workers = Arc::new(Semaphore::new(app.settings.workers));
    info!(
        address = %local_addr,
        mode = app.handler.name(),
        workers = app.settings.workers,
        "listener started"
    );

    loop {
        let permit = workers
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = http::handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
            drop(permit);
        });
    }
}
