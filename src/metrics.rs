use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("webshare_requests_total", "Requests by method and status class");
    let vec = IntCounterVec::new(opts, &["method", "status"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register webshare_requests_total");
    vec
});

static REQUEST_CACHE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "webshare_request_cache_total",
        "Requests by cache outcome (hit, method_hit, miss, stored, skipped, bypassed)",
    );
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register webshare_request_cache_total");
    vec
});

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "webshare_request_duration_seconds",
        "Time from accept to the last response byte",
    )
    .buckets(latency_buckets());
    let vec = HistogramVec::new(opts, &["status"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register webshare_request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("webshare_cache_lookup_total", "Local file lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register webshare_cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("webshare_cache_store_total", "Cache files committed")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register webshare_cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "webshare_cache_store_errors_total",
        "Cache writes that failed or were abandoned",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register webshare_cache_store_errors_total");
    counter
});

static ORIGIN_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("webshare_origin_requests_total", "Requests forwarded to the origin");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register webshare_origin_requests_total");
    vec
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(method: &str, cache: Option<&str>, status: StatusCode, elapsed: Duration) {
    let status_class = status_class(status.as_u16());
    let method = if method.is_empty() { "unknown" } else { method };
    REQUESTS_TOTAL
        .with_label_values(&[method, status_class])
        .inc();
    if let Some(cache) = cache {
        REQUEST_CACHE_TOTAL.with_label_values(&[cache]).inc();
    }
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[status_class])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let label = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_origin_request(method: &Method) {
    ORIGIN_REQUESTS_TOTAL
        .with_label_values(&[method.as_str()])
        .inc();
}

pub fn gather() -> Result<Vec<u8>> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;
    Ok(buffer)
}

/// Plain-HTTP exposition endpoint. Anything other than `GET {path}` gets a 404.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    loop {
        let (stream, _) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, &path).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S, path: &str) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    handle_stream_with_limits(
        stream,
        path,
        METRICS_READ_TIMEOUT,
        METRICS_MAX_REQUEST_BYTES,
    )
    .await
}

async fn handle_stream_with_limits<S>(
    stream: S,
    path: &str,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let mut total_bytes = 0usize;
    let bytes = read_line_with_limits(
        &mut reader,
        &mut request_line,
        read_timeout,
        max_bytes,
        &mut total_bytes,
        "reading metrics request line",
    )
    .await?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    loop {
        let mut line = String::new();
        let n = read_line_with_limits(
            &mut reader,
            &mut line,
            read_timeout,
            max_bytes,
            &mut total_bytes,
            "reading metrics request headers",
        )
        .await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == path {
        build_response(200, TextEncoder::new().format_type(), gather()?)
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

async fn read_line_with_limits<R>(
    reader: &mut BufReader<R>,
    buf: &mut String,
    timeout_dur: Duration,
    max_bytes: usize,
    total: &mut usize,
    context: &str,
) -> Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    ensure!(max_bytes > 0, "max_bytes must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    loop {
        let available = timeout(timeout_dur, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out {context}"))??;
        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            anyhow::bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        let remaining = max_bytes
            .checked_sub(*total)
            .ok_or_else(|| anyhow!("metrics request exceeded allowed size"))?;
        if collected.len().saturating_add(consume) > remaining {
            anyhow::bail!("metrics request exceeded allowed size");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("metrics request contained invalid bytes"))?;
    let bytes = string.len();
    *total = total.saturating_add(bytes);
    ensure!(*total <= max_bytes, "metrics request exceeded allowed size");
    *buf = string;
    Ok(bytes)
}
