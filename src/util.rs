use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

/// Awaits `future`, applying [`timeout_with_context`] only when a limit is given.
pub async fn maybe_timeout<F, T, E>(
    duration: Option<Duration>,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match duration {
        Some(limit) => timeout_with_context(limit, future, context).await,
        None => {
            let context = context.into();
            future
                .await
                .with_context(|| format!("failed while {context}"))
        }
    }
}
