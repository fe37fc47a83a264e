use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A complete response read until the server closed the connection.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First value of `name`, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Writes `raw` and reads until close. Every response is close-delimited.
pub async fn send_request(addr: SocketAddr, raw: &[u8]) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw).await?;
    let mut buf = Vec::new();
    timeout(StdDuration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .context("timed out waiting for response")??;
    parse_response(&buf)
}

pub fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no complete head: {:?}", String::from_utf8_lossy(raw)))?;
    let head = String::from_utf8(raw[..split].to_vec()).context("invalid UTF-8 response head")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response line"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))?;
    Ok(HttpResponse {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    })
}
