use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use super::headers::HeaderAccumulator;
use super::line::read_line_with_timeout;

pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

/// Reads a status line and headers from the origin. The origin connection carries no
/// timeout of its own.
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let bytes =
        read_line_with_timeout(reader, &mut status_line, None, peer, max_header_bytes).await?;
    if bytes == 0 {
        bail!("origin closed connection before sending status line");
    }
    let (_, status, _) = parse_status_line(status_line.trim_end_matches(['\r', '\n']))?;

    let mut headers = HeaderAccumulator::new(
        max_header_bytes,
        "origin response headers exceed configured limit",
    )?;
    let mut header_line = String::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut header_line,
            None,
            peer,
            headers.remaining().max(1),
        )
        .await?;
        if read == 0 {
            bail!("origin closed connection during headers");
        }
        if !headers
            .push_line(&header_line)
            .context("invalid header from origin")?
        {
            break;
        }
    }

    if headers.is_chunked() && headers.content_length().is_some() {
        warn!(
            peer = %peer,
            "origin response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("origin response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        status,
        content_length: headers.content_length(),
        chunked: headers.is_chunked(),
        headers: headers.into_map(),
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported origin HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid origin status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported origin status code '{status_code}'"))?;

    Ok((version, status, reason))
}

/// Encodes a response head for the client. Every response closes its connection, so any
/// `Connection` header in `headers` is replaced with `Connection: close`.
pub(crate) fn encode_response_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if name == http::header::CONNECTION {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(b"Connection: close\r\n\r\n");
    buffer
}
