use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, Method, Uri};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use super::headers::HeaderAccumulator;
use super::line::{read_line_with_deadline, remaining_deadline};
use crate::util::timeout_with_context;

pub(crate) struct RequestHead {
    pub method: Method,
    /// Path component as sent, still percent-encoded.
    pub path: String,
    /// Raw query string without the leading `?`; empty when absent.
    pub query: String,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Reads a request line and header block. The whole head must arrive within
/// `header_timeout`; `Ok(None)` means the client closed without sending anything.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + header_timeout;
    let context = format!("waiting for request from {peer}");
    let available = timeout_with_context(
        remaining_deadline(deadline, &context)?,
        reader.fill_buf(),
        context.as_str(),
    )
    .await?;
    if available.is_empty() {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }

    let mut request_line = String::new();
    let request_line_bytes = read_line_with_deadline(
        reader,
        &mut request_line,
        deadline,
        peer,
        max_header_bytes,
    )
    .await?;
    if request_line_bytes == 0 {
        return Ok(None);
    }
    if !request_line.ends_with('\n') {
        bail!("request line for {peer} missing newline terminator");
    }
    let request_line = request_line.trim_end_matches(['\r', '\n']);
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    if !matches!(version, "HTTP/1.1" | "HTTP/1.0") {
        bail!("invalid HTTP version '{version}'");
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let (path, query) = split_target(target)?;

    let remaining = max_header_bytes.saturating_sub(request_line_bytes);
    if remaining == 0 {
        bail!("request headers exceed configured limit");
    }
    let mut headers =
        HeaderAccumulator::new(remaining, "request headers exceed configured limit")?;
    let mut header_line = String::new();
    loop {
        let read = read_line_with_deadline(
            reader,
            &mut header_line,
            deadline,
            peer,
            headers.remaining().max(1),
        )
        .await?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        if !headers
            .push_line(&header_line)
            .with_context(|| format!("invalid header from {peer}"))?
        {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        path,
        query,
        content_length: headers.content_length(),
        chunked: headers.is_chunked(),
        headers: headers.into_map(),
    }))
}

/// Accepts origin-form (`/a/b?q`) and absolute-form (`http://host/a/b?q`) targets.
fn split_target(target: &str) -> Result<(String, String)> {
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    if uri.scheme().is_none() && !target.starts_with('/') {
        bail!("unsupported request target '{target}'");
    }
    let path = match uri.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    let query = uri.query().unwrap_or_default().to_string();
    Ok((path, query))
}
