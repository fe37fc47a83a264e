use std::path::PathBuf;

use crc32fast::Hasher;
use http::Method;

use super::path::{CacheRoot, RequestPath};

/// Whether a request must be stored under a checksum-keyed name instead of its literal path.
pub fn needs_key(method: &Method, query: &str) -> bool {
    *method != Method::GET || !query.is_empty()
}

/// Incremental CRC-32 (IEEE) over the query string followed by the request body, in the
/// order the bytes are forwarded. Requests with the same checksum share a cache file.
#[derive(Clone)]
pub struct CacheKeyer {
    hasher: Hasher,
    fed: u64,
}

impl CacheKeyer {
    pub fn new(query: &str) -> Self {
        let mut keyer = Self {
            hasher: Hasher::new(),
            fed: 0,
        };
        keyer.update(query.as_bytes());
        keyer
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.fed = self.fed.saturating_add(chunk.len() as u64);
    }

    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// `{root}/__{METHOD}/{path}.{crc:08x}`; the suffix is left off when neither a query
    /// nor a body contributed any byte.
    pub fn keyed_path(&self, root: &CacheRoot, method: &Method, path: &RequestPath) -> PathBuf {
        let scoped = root.method_scoped(method, path);
        if self.fed == 0 {
            return scoped;
        }
        let mut name = scoped.into_os_string();
        name.push(format!(".{:08x}", self.checksum()));
        PathBuf::from(name)
    }
}
