use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::io_util::Sink;
use crate::proxy::http::codec::{RequestHead, ResponseHead, read_line_with_timeout};
use crate::proxy::limits::BodySizeTracker;
use crate::util::maybe_timeout;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// How the bytes of a message body are delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

impl BodyPlan {
    pub fn for_request(head: &RequestHead) -> Self {
        if head.chunked {
            BodyPlan::Chunked
        } else {
            match head.content_length {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }

    /// HEAD responses and 1xx/204/304 never carry a body, whatever the headers claim.
    pub fn for_response(method: &Method, head: &ResponseHead) -> Self {
        if *method == Method::HEAD
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            return BodyPlan::Empty;
        }
        if head.chunked {
            return BodyPlan::Chunked;
        }
        match head.content_length {
            Some(0) => BodyPlan::Empty,
            Some(length) => BodyPlan::Fixed(length),
            None => BodyPlan::UntilClose,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BodyPlan::Empty)
    }
}

#[derive(Clone, Copy)]
enum ReadState {
    Fixed { remaining: u64 },
    Chunked { remaining: u64, started: bool },
    UntilClose,
    Done,
}

/// Decodes a message body into plain payload bytes.
pub struct BodyReader<'a, S> {
    reader: &'a mut BufReader<S>,
    state: ReadState,
    peer: SocketAddr,
    io_timeout: Option<Duration>,
    limit: Option<BodySizeTracker>,
}

impl<'a, S> BodyReader<'a, S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(
        reader: &'a mut BufReader<S>,
        plan: BodyPlan,
        peer: SocketAddr,
        io_timeout: Option<Duration>,
    ) -> Self {
        let state = match plan {
            BodyPlan::Empty => ReadState::Done,
            BodyPlan::Fixed(remaining) => ReadState::Fixed { remaining },
            BodyPlan::Chunked => ReadState::Chunked {
                remaining: 0,
                started: false,
            },
            BodyPlan::UntilClose => ReadState::UntilClose,
        };
        Self {
            reader,
            state,
            peer,
            io_timeout,
            limit: None,
        }
    }

    /// Caps the decoded payload size; exceeding it fails with a 413-mapped error.
    pub fn with_limit(mut self, max_bytes: u64) -> Self {
        self.limit = Some(BodySizeTracker::new(max_bytes));
        self
    }

    /// Fills `buf` with the next payload bytes. Returns 0 once the body is complete.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let read = match self.state {
            ReadState::Done => return Ok(0),
            ReadState::Fixed { remaining } => {
                if remaining == 0 {
                    self.state = ReadState::Done;
                    return Ok(0);
                }
                let want = remaining.min(buf.len() as u64) as usize;
                let read = self.read_raw(&mut buf[..want]).await?;
                if read == 0 {
                    bail!("unexpected EOF while reading body from {}", self.peer);
                }
                self.state = ReadState::Fixed {
                    remaining: remaining - read as u64,
                };
                read
            }
            ReadState::Chunked { remaining, started } => {
                let remaining = if remaining == 0 {
                    if started {
                        self.expect_crlf().await?;
                    }
                    let size = self.read_chunk_size().await?;
                    if size == 0 {
                        self.skip_trailers().await?;
                        self.state = ReadState::Done;
                        return Ok(0);
                    }
                    size
                } else {
                    remaining
                };
                let want = remaining.min(buf.len() as u64) as usize;
                let read = self.read_raw(&mut buf[..want]).await?;
                if read == 0 {
                    bail!("unexpected EOF while reading chunk data from {}", self.peer);
                }
                self.state = ReadState::Chunked {
                    remaining: remaining - read as u64,
                    started: true,
                };
                read
            }
            ReadState::UntilClose => {
                let read = self.read_raw(buf).await?;
                if read == 0 {
                    self.state = ReadState::Done;
                    return Ok(0);
                }
                read
            }
        };
        if let Some(limit) = self.limit.as_mut() {
            limit.record(read)?;
        }
        Ok(read)
    }

    async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let context = format!("reading body from {}", self.peer);
        maybe_timeout(self.io_timeout, self.reader.read(buf), context).await
    }

    async fn read_chunk_size(&mut self) -> Result<u64> {
        let mut line = String::new();
        let read = read_line_with_timeout(
            &mut *self.reader,
            &mut line,
            self.io_timeout,
            self.peer,
            MAX_CHUNK_LINE_LENGTH,
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk size from {}", self.peer);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        u64::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))
    }

    async fn expect_crlf(&mut self) -> Result<()> {
        let mut crlf = [0u8; 2];
        let context = format!("reading chunk terminator from {}", self.peer);
        maybe_timeout(self.io_timeout, self.reader.read_exact(&mut crlf), context).await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {}", self.peer);
        }
        Ok(())
    }

    async fn skip_trailers(&mut self) -> Result<()> {
        let mut line = String::new();
        loop {
            let read = read_line_with_timeout(
                &mut *self.reader,
                &mut line,
                self.io_timeout,
                self.peer,
                MAX_CHUNK_LINE_LENGTH,
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk trailer from {}", self.peer);
            }
            if line.trim_end_matches(['\r', '\n']).is_empty() {
                return Ok(());
            }
        }
    }
}

/// Pumps the remaining body into `sink` in `chunk_size` pieces, yielding to the scheduler
/// between chunks. Returns the number of payload bytes copied.
pub async fn copy_body<S, K>(
    body: &mut BodyReader<'_, S>,
    sink: &mut K,
    chunk_size: usize,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    K: Sink + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;
    loop {
        let read = body.read_chunk(&mut buffer).await?;
        if read == 0 {
            break;
        }
        sink.write_all(&buffer[..read])
            .await
            .context("writing body to sink")?;
        copied = copied.saturating_add(read as u64);
        tokio::task::yield_now().await;
    }
    sink.flush().await.context("flushing body sink")?;
    Ok(copied)
}

/// Writes one chunk in HTTP/1.1 chunked framing.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await
}

pub async fn finish_chunks<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"0\r\n\r\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_util::{Destination, FailurePolicy};
    use crate::proxy::error::classify_error;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn drain(raw: &[u8], plan: BodyPlan, buf_len: usize) -> Result<Vec<u8>> {
        let mut reader = BufReader::new(raw);
        let mut body = BodyReader::new(&mut reader, plan, peer(), None);
        let mut out = Vec::new();
        let mut buf = vec![0u8; buf_len];
        loop {
            let read = body.read_chunk(&mut buf).await?;
            if read == 0 {
                break;
            }
            out.extend_from_slice(&buf[..read]);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn fixed_body_stops_at_length() -> Result<()> {
        assert_eq!(drain(b"hello world", BodyPlan::Fixed(5), 2).await?, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn fixed_body_reports_truncation() {
        let err = drain(b"abc", BodyPlan::Fixed(10), 16)
            .await
            .expect_err("short body");
        assert!(err.to_string().contains("unexpected EOF"));
    }

    #[tokio::test]
    async fn chunked_body_is_decoded_with_trailers() -> Result<()> {
        let raw = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        assert_eq!(drain(raw, BodyPlan::Chunked, 3).await?, b"Wikipedia");
        Ok(())
    }

    #[tokio::test]
    async fn chunked_body_rejects_bad_terminator() {
        let raw = b"2\r\nabXY3\r\ncde\r\n0\r\n\r\n";
        let err = drain(raw, BodyPlan::Chunked, 16)
            .await
            .expect_err("bad terminator");
        assert!(err.to_string().contains("invalid chunk terminator"));
    }

    #[tokio::test]
    async fn until_close_reads_everything() -> Result<()> {
        assert_eq!(drain(b"all of it", BodyPlan::UntilClose, 4).await?, b"all of it");
        Ok(())
    }

    #[tokio::test]
    async fn limit_maps_to_body_too_large() {
        let raw = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let mut body =
            BodyReader::new(&mut reader, BodyPlan::Chunked, peer(), None).with_limit(4);
        let mut buf = [0u8; 64];
        let err = body.read_chunk(&mut buf).await.expect_err("over limit");
        assert_eq!(classify_error(&err).reason(), "body_too_large");
    }

    #[tokio::test]
    async fn copy_body_moves_all_bytes_into_sink() -> Result<()> {
        let raw = b"0123456789abcdef";
        let mut reader = BufReader::new(&raw[..]);
        let mut body = BodyReader::new(&mut reader, BodyPlan::Fixed(16), peer(), None);
        let mut out = Vec::new();
        let mut sink = Destination::new("test", &mut out, FailurePolicy::Propagate);
        let copied = copy_body(&mut body, &mut sink, 5).await?;
        assert_eq!(copied, 16);
        drop(sink);
        assert_eq!(out, raw);
        Ok(())
    }

    #[tokio::test]
    async fn chunk_writer_frames_payload() -> Result<()> {
        let mut out = Vec::new();
        write_chunk(&mut out, b"hello, world").await?;
        write_chunk(&mut out, b"").await?;
        finish_chunks(&mut out).await?;
        assert_eq!(out, b"c\r\nhello, world\r\n0\r\n\r\n");
        Ok(())
    }
}
