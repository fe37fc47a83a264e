use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub method: String,
    pub path: String,
    pub query: String,
    /// `hit`, `method_hit`, `miss`, `stored`, `skipped` or `bypassed`.
    pub cache: Option<String>,
    pub target: Option<String>,
    pub status: u16,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub error_reason: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                path: String::new(),
                query: String::new(),
                cache: None,
                target: None,
                status: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                error_reason: None,
                error_detail: None,
            },
        }
    }

    /// Records the request line as soon as it is parsed.
    pub fn set_request(&mut self, method: &str, path: &str, query: &str) {
        self.event.method = method.to_string();
        self.event.path = path.to_string();
        self.event.query = query.to_string();
    }

    pub fn set_error(&mut self, reason: impl Into<String>, detail: impl Into<String>) {
        self.event.error_reason = Some(reason.into());
        self.event.error_detail = Some(detail.into());
    }

    pub fn cache(mut self, value: impl Into<String>) -> Self {
        self.event.cache = Some(value.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.event.target = Some(target.into());
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        path,
        query,
        cache,
        target,
        status,
        bytes_out,
        elapsed_ms,
        error_reason,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let cache_field = cache.as_deref();
    let target_field = target.as_deref();
    let error_reason_field = error_reason.as_deref();
    let error_detail_field = error_detail.as_deref();

    tracing::info!(
        log = "access",
        ts,
        client_ip = %client_ip,
        client_port,
        method,
        path,
        query,
        cache = cache_field,
        file = target_field,
        status,
        bytes_out,
        elapsed_ms,
        error_reason = error_reason_field,
        error_detail = error_detail_field
    );

    crate::metrics::record_request(
        &method,
        cache.as_deref(),
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Duration::from_millis(elapsed_ms as u64),
    );
}
