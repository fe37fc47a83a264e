use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Result, ensure};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::proxy::error::ProxyError;
use crate::proxy::http::codec::encode_response_head;

/// Write half of a client connection. Counts bytes and remembers whether the response
/// head went out, which decides whether a late failure can still become an error status.
pub struct ClientSink<W> {
    inner: W,
    head_sent: bool,
    bytes_out: u64,
}

impl<W> ClientSink<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            head_sent: false,
            bytes_out: 0,
        }
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub async fn send_head(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<()> {
        ensure!(!self.head_sent, "response head already sent");
        self.head_sent = true;
        let encoded = encode_response_head(status, headers);
        self.write_all(&encoded)
            .await
            .map_err(|source| ProxyError::ClientDisconnect { source })?;
        Ok(())
    }

    /// Sends a complete short text response.
    pub async fn send_text(&mut self, status: StatusCode, body: &str) -> Result<()> {
        self.send_text_with(status, HeaderMap::new(), body).await
    }

    pub async fn send_text_with(
        &mut self,
        status: StatusCode,
        mut headers: HeaderMap,
        body: &str,
    ) -> Result<()> {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=UTF-8"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.send_head(status, &headers).await?;
        self.write_all(body.as_bytes())
            .await
            .map_err(|source| ProxyError::ClientDisconnect { source })?;
        self.flush()
            .await
            .map_err(|source| ProxyError::ClientDisconnect { source })?;
        Ok(())
    }
}

impl<W> AsyncWrite for ClientSink<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = poll {
            self.bytes_out = self.bytes_out.saturating_add(written as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
