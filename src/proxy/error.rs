use std::io;
use std::path::PathBuf;

use anyhow::Error;
use http::StatusCode;
use thiserror::Error;

/// Typed request failures. They travel inside `anyhow::Error` and are recovered with
/// [`classify_error`] when the connection handler decides on a status and a log line.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("request body exceeds configured limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("origin request to {url} failed: {source}")]
    Upstream {
        url: String,
        #[source]
        source: Error,
    },

    #[error("cannot write cache file {}: {source}", path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("client went away: {source}")]
    ClientDisconnect {
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn upstream(url: impl Into<String>, source: impl Into<Error>) -> Self {
        Self::Upstream {
            url: url.into(),
            source: source.into(),
        }
    }

    pub fn cache_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CacheWrite {
            path: path.into(),
            source,
        }
    }

    /// Status sent to the client when nothing has been written to it yet.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::CacheWrite { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ClientDisconnect { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used as `error_reason` in the access log.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::BadRequest { .. } => "bad_request",
            ProxyError::BodyTooLarge { .. } => "body_too_large",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::CacheWrite { .. } => "cache_write_error",
            ProxyError::ClientDisconnect { .. } => "client_disconnect",
        }
    }
}

/// Normalized view of a request failure.
pub enum ErrorKind<'a> {
    Typed(&'a ProxyError),
    Other,
}

pub fn classify_error(err: &Error) -> ErrorKind<'_> {
    match err.downcast_ref::<ProxyError>() {
        Some(typed) => ErrorKind::Typed(typed),
        None => ErrorKind::Other,
    }
}

impl ErrorKind<'_> {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Typed(err) => err.status(),
            ErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ErrorKind::Typed(err) => err.reason(),
            ErrorKind::Other => "internal_error",
        }
    }

    /// Client disconnects are expected noise and are not worth a warning.
    pub fn is_client_disconnect(&self) -> bool {
        matches!(self, ErrorKind::Typed(ProxyError::ClientDisconnect { .. }))
    }
}
