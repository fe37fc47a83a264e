use std::fs::Metadata;
use std::path::{Path, PathBuf};

use http::Method;

use crate::proxy::error::ProxyError;

pub(crate) const INDEX_FILE: &str = "index.html";

/// A request path decoded and split into safe relative segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    segments: Vec<String>,
    trailing_slash: bool,
}

impl RequestPath {
    /// Percent-decodes `raw` and drops empty and `.` segments. A `..` segment is rejected so
    /// no derived path can leave the cache root.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let decoded = urlencoding::decode(raw)
            .map_err(|_| ProxyError::bad_request(format!("path '{raw}' is not valid UTF-8")))?;
        if decoded.contains('\0') || decoded.contains('\\') {
            return Err(ProxyError::bad_request(format!(
                "path '{raw}' contains forbidden characters"
            )));
        }

        let mut segments = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(ProxyError::bad_request(format!(
                        "path '{raw}' escapes the root directory"
                    )));
                }
                other => segments.push(other.to_string()),
            }
        }
        let trailing_slash = decoded.ends_with('/') && !segments.is_empty();
        Ok(Self {
            segments,
            trailing_slash,
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn trailing_slash(&self) -> bool {
        self.trailing_slash
    }

    pub fn relative(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Relative form used as a file name under a method directory.
    fn leaf_relative(&self) -> PathBuf {
        if self.is_root() {
            PathBuf::from(INDEX_FILE)
        } else {
            self.relative()
        }
    }
}

impl std::fmt::Display for RequestPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.segments.join("/"))?;
        if self.trailing_slash {
            f.write_str("/")?;
        }
        Ok(())
    }
}

/// How a local file was found for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// `{root}/{path}`.
    Direct,
    /// `{root}/__{METHOD}/{path}`.
    MethodScoped,
    /// `{root}/__{METHOD}/{path}.{crc}`.
    Keyed,
}

impl HitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitKind::Direct => "hit",
            HitKind::MethodScoped | HitKind::Keyed => "method_hit",
        }
    }
}

/// Maps requests to on-disk cache locations under a single root directory.
#[derive(Debug, Clone)]
pub struct CacheRoot {
    root: PathBuf,
}

impl CacheRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `{root}/{path}`, pointing at `index.html` for GET requests on `/` or a path ending in
    /// a slash.
    pub fn direct(&self, method: &Method, path: &RequestPath) -> PathBuf {
        let candidate = self.root.join(path.relative());
        if *method == Method::GET && (path.is_root() || path.trailing_slash()) {
            candidate.join(INDEX_FILE)
        } else {
            candidate
        }
    }

    /// `{root}/__{METHOD}/{path}`.
    pub fn method_scoped(&self, method: &Method, path: &RequestPath) -> PathBuf {
        self.root
            .join(format!("__{}", method.as_str()))
            .join(path.leaf_relative())
    }
}

/// Returns the metadata of `path` when it exists and is a regular file.
pub(crate) async fn file_metadata(path: &Path) -> Option<Metadata> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Some(metadata),
        _ => None,
    }
}

/// Resolves the direct candidate, following a GET on a directory to its `index.html`.
pub(crate) async fn find_direct(
    root: &CacheRoot,
    method: &Method,
    path: &RequestPath,
) -> (PathBuf, Option<Metadata>) {
    let candidate = root.direct(method, path);
    if *method == Method::GET
        && let Ok(metadata) = tokio::fs::metadata(&candidate).await
        && metadata.is_dir()
    {
        let index = candidate.join(INDEX_FILE);
        let found = file_metadata(&index).await;
        return (index, found);
    }
    let found = file_metadata(&candidate).await;
    (candidate, found)
}
