use std::fs::Metadata;
use std::path::PathBuf;

use http::Method;
use tracing::trace;

mod key;
mod path;
mod writer;

pub use key::{CacheKeyer, needs_key};
pub(crate) use path::{find_direct, file_metadata};
pub use path::{CacheRoot, HitKind, RequestPath};
pub use writer::CacheFile;

/// A file on disk that answers a request without contacting the origin.
#[derive(Debug)]
pub struct LocalFile {
    pub path: PathBuf,
    pub kind: HitKind,
    pub metadata: Metadata,
}

/// Result of probing the cache for a request.
pub struct Lookup {
    /// The direct candidate; also the logical name the content type is derived from.
    pub direct: PathBuf,
    pub hit: Option<LocalFile>,
}

/// Probes, in order, the direct path, the method-scoped path and, when the request carries
/// no body, the checksum-keyed path computed from the query alone.
pub async fn lookup(
    root: &CacheRoot,
    method: &Method,
    path: &RequestPath,
    query: &str,
    has_body: bool,
) -> Lookup {
    let (direct, found) = path::find_direct(root, method, path).await;
    if let Some(metadata) = found {
        return Lookup {
            hit: Some(LocalFile {
                path: direct.clone(),
                kind: HitKind::Direct,
                metadata,
            }),
            direct,
        };
    }

    let scoped = root.method_scoped(method, path);
    if let Some(metadata) = file_metadata(&scoped).await {
        return Lookup {
            direct,
            hit: Some(LocalFile {
                path: scoped,
                kind: HitKind::MethodScoped,
                metadata,
            }),
        };
    }

    if !has_body && needs_key(method, query) {
        let keyed = CacheKeyer::new(query).keyed_path(root, method, path);
        if keyed != scoped
            && let Some(metadata) = file_metadata(&keyed).await
        {
            return Lookup {
                direct,
                hit: Some(LocalFile {
                    path: keyed,
                    kind: HitKind::Keyed,
                    metadata,
                }),
            };
        }
    }

    trace!(path = %path, method = %method, "no local file for request");
    Lookup { direct, hit: None }
}
