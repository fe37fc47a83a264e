use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request as the origin saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Minimal HTTP origin that counts requests and answers each with the same response.
pub struct MockOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn ok(content_type: &str, body: impl AsRef<[u8]>) -> Result<Self> {
        let body = body.as_ref();
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        Self::respond_with(response).await
    }

    /// Close-delimited 200 response without a `Content-Length`.
    pub async fn until_close(body: impl AsRef<[u8]>) -> Result<Self> {
        let mut response = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(body.as_ref());
        Self::respond_with(response).await
    }

    pub async fn chunked(chunks: &[&[u8]]) -> Result<Self> {
        let mut response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
        for chunk in chunks {
            response.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            response.extend_from_slice(chunk);
            response.extend_from_slice(b"\r\n");
        }
        response.extend_from_slice(b"0\r\n\r\n");
        Self::respond_with(response).await
    }

    pub async fn status(status_line: &str, body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        Self::respond_with(response.into_bytes()).await
    }

    pub async fn respond_with(response: Vec<u8>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let response = Arc::new(response);

        let handle = {
            let requests = requests.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                loop {
                    let (mut socket, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let requests = requests.clone();
                    let recorded = recorded.clone();
                    let response = response.clone();
                    tokio::spawn(async move {
                        if let Ok(Some(request)) = read_request(&mut socket).await {
                            requests.fetch_add(1, Ordering::SeqCst);
                            recorded.lock().push(request);
                            let _ = socket.write_all(&response).await;
                            socket.shutdown().await.ok();
                        }
                    });
                }
            })
        };

        Ok(Self {
            addr,
            requests,
            recorded,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Reads one request, with a fixed-length or chunked body.
async fn read_request(socket: &mut TcpStream) -> Result<Option<RecordedRequest>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    let find = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };

    let mut rest = data[head_end..].to_vec();
    let body = if let Some(length) = find("content-length").and_then(|v| v.parse::<usize>().ok())
    {
        while rest.len() < length {
            let n = socket.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&buf[..n]);
        }
        rest.truncate(length);
        rest
    } else if find("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        while !rest.ends_with(b"0\r\n\r\n") {
            let n = socket.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&buf[..n]);
        }
        decode_chunked(&rest)
    } else {
        Vec::new()
    };

    Ok(Some(RecordedRequest {
        request_line,
        headers,
        body,
    }))
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    while let Some(line_end) = raw.windows(2).position(|w| w == b"\r\n") {
        let size_text = String::from_utf8_lossy(&raw[..line_end]).into_owned();
        let Ok(size) = usize::from_str_radix(size_text.trim(), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let Some(chunk) = raw.get(start..start + size) else {
            break;
        };
        body.extend_from_slice(chunk);
        raw = raw.get(start + size + 2..).unwrap_or_default();
    }
    body
}
