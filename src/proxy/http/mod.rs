mod body;
mod codec;
mod respond;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

pub use body::{BodyPlan, BodyReader, copy_body, finish_chunks, write_chunk};
pub(crate) use codec::{
    RequestHead, ResponseHead, connection_tokens, read_request_head, read_response_head,
};
pub use respond::ClientSink;

use crate::auth::{ACCESS_DENIED, Authenticator};
use crate::io_util::{Destination, FailurePolicy};
use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::cache::RequestPath;
use crate::proxy::error::{ProxyError, classify_error};
use crate::proxy::handler::{ClientReader, ClientWriter, Exchange, Request};

/// Most of an unread request body that is drained before closing the connection.
const MAX_DISCARD_BYTES: u64 = 1 << 20;
const DISCARD_CHUNK_SIZE: usize = 16 * 1024;

/// Serves the single request a connection carries, then closes it.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let started = Instant::now();
    let (read_half, write_half) = tokio::io::split(stream);
    let reader: ClientReader = BufReader::new(Box::new(read_half));
    let writer: ClientWriter = ClientSink::new(Box::new(write_half));
    let mut exchange = Exchange::new(reader, writer);
    let mut log = AccessLogBuilder::new(peer);

    let result = serve_request(&app, peer, &mut exchange, &mut log).await;
    let status = match result {
        Ok(Some(status)) => Some(status),
        Ok(None) => None,
        Err(err) => Some(report_failure(&err, peer, started, &mut exchange, &mut log).await),
    };

    let _ = exchange.client.flush().await;
    discard_unread_body(&mut exchange, peer, app.settings.client_timeout()).await;
    let _ = exchange.client.shutdown().await;

    if let Some(status) = status {
        if let Some(cache) = exchange.cache {
            log = log.cache(cache);
        }
        if let Some(target) = exchange.target.as_ref() {
            log = log.target(target.display().to_string());
        }
        log.status(status)
            .bytes_out(exchange.client.bytes_out())
            .elapsed(started.elapsed())
            .log();
    }
    Ok(())
}

/// Runs one request through the configured handler. `Ok(None)` means the client closed
/// the connection without sending a request.
async fn serve_request(
    app: &AppContext,
    peer: SocketAddr,
    exchange: &mut Exchange,
    log: &mut AccessLogBuilder,
) -> Result<Option<StatusCode>> {
    let settings = &app.settings;
    let Some(head) = read_request_head(
        &mut exchange.reader,
        peer,
        settings.client_timeout(),
        settings.max_header_size,
    )
    .await
    .map_err(|err| ProxyError::bad_request(format!("{err:#}")))?
    else {
        return Ok(None);
    };

    log.set_request(head.method.as_str(), &head.path, &head.query);
    let body = BodyPlan::for_request(&head);
    exchange.unread_body = body;
    let path = RequestPath::parse(&head.path)?;
    let mut request = Request {
        peer,
        method: head.method,
        raw_path: head.path,
        path,
        query: head.query,
        headers: head.headers,
        body,
        params: HashMap::new(),
    };

    let handler = app.handler.as_ref();
    if !handler.authenticate(&request) {
        exchange
            .client
            .send_text_with(
                StatusCode::UNAUTHORIZED,
                Authenticator::challenge(),
                ACCESS_DENIED,
            )
            .await?;
        return Ok(Some(StatusCode::UNAUTHORIZED));
    }

    if !request.query.is_empty() {
        match serde_urlencoded::from_str::<Vec<(String, String)>>(&request.query) {
            Ok(pairs) => {
                for (name, value) in pairs {
                    handler.handle_param(&mut request, &name, &value);
                }
            }
            Err(err) => debug!(peer = %peer, error = %err, "ignoring undecodable query string"),
        }
    }

    let lookup = handler
        .resolve(&request)
        .await
        .context("resolving local file")?;
    let status = handler.respond(&request, lookup, exchange).await?;
    debug!(
        peer = %peer,
        handler = handler.name(),
        status = status.as_u16(),
        "request complete"
    );
    Ok(Some(status))
}

/// Reads and drops a request body the handler answered without consuming. Closing a
/// socket with unread input resets it, which can cut off the response in flight.
async fn discard_unread_body(exchange: &mut Exchange, peer: SocketAddr, io_timeout: Duration) {
    let plan = std::mem::replace(&mut exchange.unread_body, BodyPlan::Empty);
    if plan.is_empty() {
        return;
    }
    let mut body = BodyReader::new(&mut exchange.reader, plan, peer, Some(io_timeout))
        .with_limit(MAX_DISCARD_BYTES);
    let mut sink = Destination::new("discard", tokio::io::sink(), FailurePolicy::Propagate);
    match copy_body(&mut body, &mut sink, DISCARD_CHUNK_SIZE).await {
        Ok(bytes) => debug!(peer = %peer, bytes, "discarded unread request body"),
        Err(err) => debug!(peer = %peer, error = %err, "stopped discarding request body"),
    }
}

/// Logs a failed request and, if no response head went out yet, answers with the status
/// the error maps to.
async fn report_failure(
    err: &anyhow::Error,
    peer: SocketAddr,
    started: Instant,
    exchange: &mut Exchange,
    log: &mut AccessLogBuilder,
) -> StatusCode {
    let kind = classify_error(err);
    let status = kind.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let cache_target = exchange
        .target
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    if kind.is_client_disconnect() {
        debug!(peer = %peer, elapsed_ms, cache_target, error = %err, "client disconnected");
    } else {
        warn!(
            peer = %peer,
            elapsed_ms,
            cache_target,
            reason = kind.reason(),
            error = format!("{err:#}"),
            "request failed"
        );
    }
    log.set_error(kind.reason(), format!("{err:#}"));

    if exchange.client.head_sent() {
        return status;
    }
    let body = match status {
        StatusCode::BAD_REQUEST => "Bad request",
        StatusCode::PAYLOAD_TOO_LARGE => "Request body too large",
        StatusCode::BAD_GATEWAY => "Bad gateway",
        _ => "Internal server error",
    };
    if let Err(send_err) = exchange.client.send_text(status, body).await {
        debug!(peer = %peer, error = %send_err, "failed to send error response");
    }
    status
}
