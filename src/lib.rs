pub mod auth;
pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod mime;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

const METRICS_PATH: &str = "/metrics";

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, METRICS_PATH.to_string()).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let app = proxy::AppContext::from_settings(settings.clone())?;
    tracing::info!(
        listen = %settings.listen,
        root = %settings.root.display(),
        mode = ?settings.mode,
        origin = settings.origin.as_deref().unwrap_or(""),
        read_only = settings.read_only,
        workers = settings.workers,
        "webshare starting"
    );
    proxy::run(app).await
}
