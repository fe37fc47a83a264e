use std::io::SeekFrom;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::proxy::error::ProxyError;
use crate::proxy::http::ClientSink;

/// Byte window `[start, end)` of a file that is `total` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl RangeWindow {
    pub fn full(total: u64) -> Self {
        Self {
            start: 0,
            end: total,
            total,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end - 1, self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable `Range` header: 200 with the whole file.
    Full(RangeWindow),
    /// 206 with `Content-Range`.
    Partial(RangeWindow),
    /// 416; the requested start lies at or past the end of the file.
    Unsatisfiable { total: u64 },
}

/// Interprets a `Range` header against a file of `total` bytes.
///
/// Only the single `bytes=START-[END]` form is honoured. END is inclusive and clamped to the
/// file length. Multiple ranges, suffix ranges and anything unparseable fall back to the
/// full file.
pub fn resolve_range(header: Option<&str>, total: u64) -> RangeOutcome {
    let full = RangeOutcome::Full(RangeWindow::full(total));
    let Some(spec) = header.and_then(|value| value.trim().strip_prefix("bytes=")) else {
        return full;
    };
    if spec.contains(',') {
        return full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return full;
    };
    let Ok(start) = start.trim().parse::<u64>() else {
        return full;
    };
    let end = match end.trim() {
        "" => total,
        value => match value.parse::<u64>() {
            Ok(last) if last >= start => total.min(last.saturating_add(1)),
            _ => return full,
        },
    };
    if start >= end {
        return RangeOutcome::Unsatisfiable { total };
    }
    RangeOutcome::Partial(RangeWindow { start, end, total })
}

/// A local file about to be sent to the client.
pub struct FileResponse<'a> {
    pub path: &'a Path,
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub content_type: &'a str,
    /// File name for `Content-Disposition: attachment`.
    pub attachment: Option<&'a str>,
}

/// Sends `file`, honouring `range`, and streams exactly the selected window in
/// `chunk_size` pieces. HEAD gets the same headers and no body.
pub async fn serve_file<W>(
    client: &mut ClientSink<W>,
    method: &Method,
    range: Option<&str>,
    file: FileResponse<'_>,
    chunk_size: usize,
) -> Result<StatusCode>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let (status, window) = match resolve_range(range, file.len) {
        RangeOutcome::Full(window) => (StatusCode::OK, window),
        RangeOutcome::Partial(window) => {
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&window.content_range())?,
            );
            debug!(
                range = range.unwrap_or_default(),
                content_range = %window.content_range(),
                "serving byte range"
            );
            (StatusCode::PARTIAL_CONTENT, window)
        }
        RangeOutcome::Unsatisfiable { total } => {
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{total}"))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
            client.send_head(StatusCode::RANGE_NOT_SATISFIABLE, &headers).await?;
            return Ok(StatusCode::RANGE_NOT_SATISFIABLE);
        }
    };

    if let Ok(value) = HeaderValue::from_str(file.content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
    if let Some(modified) = file.modified
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Some(name) = file.attachment {
        let value = format!("attachment; filename=\"{}\"", name.replace('"', ""));
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    let mut source = tokio::fs::File::open(file.path)
        .await
        .with_context(|| format!("opening {}", file.path.display()))?;
    client.send_head(status, &headers).await?;
    if *method == Method::HEAD || window.is_empty() {
        return Ok(status);
    }

    source
        .seek(SeekFrom::Start(window.start))
        .await
        .with_context(|| format!("seeking {}", file.path.display()))?;
    let mut remaining = window.len();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let read = source
            .read(&mut buffer[..want])
            .await
            .with_context(|| format!("reading {}", file.path.display()))?;
        if read == 0 {
            bail!(
                "{} shrank while being served ({} bytes missing)",
                file.path.display(),
                remaining
            );
        }
        client
            .write_all(&buffer[..read])
            .await
            .map_err(|source| ProxyError::ClientDisconnect { source })?;
        remaining -= read as u64;
        tokio::task::yield_now().await;
    }
    client
        .flush()
        .await
        .map_err(|source| ProxyError::ClientDisconnect { source })?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn closed_range_is_inclusive() {
        assert_eq!(
            resolve_range(Some("bytes=10-19"), 100),
            RangeOutcome::Partial(RangeWindow {
                start: 10,
                end: 20,
                total: 100
            })
        );
    }

    #[test]
    fn open_range_runs_to_end() {
        let RangeOutcome::Partial(window) = resolve_range(Some("bytes=90-"), 100) else {
            panic!("expected partial window");
        };
        assert_eq!((window.start, window.end), (90, 100));
        assert_eq!(window.content_range(), "bytes 90-99/100");
    }

    #[test]
    fn end_is_clamped_to_length() {
        let RangeOutcome::Partial(window) = resolve_range(Some("bytes=50-500"), 100) else {
            panic!("expected partial window");
        };
        assert_eq!(window.end, 100);
    }

    #[test]
    fn unsupported_forms_fall_back_to_full() {
        for header in [
            "bytes=-20",
            "bytes=0-1,5-6",
            "bytes=abc",
            "bytes=5",
            "bytes=30-10",
            "items=0-5",
        ] {
            assert_eq!(
                resolve_range(Some(header), 100),
                RangeOutcome::Full(RangeWindow::full(100)),
                "{header}"
            );
        }
        assert_eq!(
            resolve_range(None, 7),
            RangeOutcome::Full(RangeWindow::full(7))
        );
    }

    #[test]
    fn start_past_end_is_unsatisfiable() {
        assert_eq!(
            resolve_range(Some("bytes=200-"), 100),
            RangeOutcome::Unsatisfiable { total: 100 }
        );
        assert_eq!(
            resolve_range(Some("bytes=0-"), 0),
            RangeOutcome::Unsatisfiable { total: 0 }
        );
    }

    async fn serve(range: Option<&str>, method: Method) -> Result<(StatusCode, String, Vec<u8>)> {
        let dir = TempDir::new()?;
        let path = dir.path().join("data.bin");
        let body: Vec<u8> = (0..100u8).collect();
        tokio::fs::write(&path, &body).await?;

        let mut out = Vec::new();
        let mut client = ClientSink::new(&mut out);
        let status = serve_file(
            &mut client,
            &method,
            range,
            FileResponse {
                path: &path,
                len: 100,
                modified: None,
                content_type: "application/octet-stream",
                attachment: None,
            },
            7,
        )
        .await?;
        drop(client);
        let split = out
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("head terminator")
            + 4;
        let head = String::from_utf8(out[..split].to_vec())?;
        Ok((status, head, out[split..].to_vec()))
    }

    #[tokio::test]
    async fn serves_requested_window() -> Result<()> {
        let (status, head, body) = serve(Some("bytes=10-19"), Method::GET).await?;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert!(head.contains("content-range: bytes 10-19/100\r\n"), "{head}");
        assert!(head.contains("content-length: 10\r\n"), "{head}");
        assert_eq!(body, (10..20u8).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn serves_whole_file_without_range() -> Result<()> {
        let (status, head, body) = serve(None, Method::GET).await?;
        assert_eq!(status, StatusCode::OK);
        assert!(head.contains("accept-ranges: bytes\r\n"));
        assert!(!head.contains("content-range"));
        assert_eq!(body.len(), 100);
        Ok(())
    }

    #[tokio::test]
    async fn head_request_gets_headers_only() -> Result<()> {
        let (status, head, body) = serve(Some("bytes=90-"), Method::HEAD).await?;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert!(head.contains("content-length: 10\r\n"));
        assert!(body.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unsatisfiable_range_sends_416() -> Result<()> {
        let (status, head, body) = serve(Some("bytes=100-"), Method::GET).await?;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(head.contains("content-range: bytes */100\r\n"));
        assert!(body.is_empty());
        Ok(())
    }
}
