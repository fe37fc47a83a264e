use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::Result;
use tempfile::{Builder as TempBuilder, TempPath};
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::AsyncWrite;
use tracing::{debug, trace};

use crate::proxy::error::ProxyError;

/// A cache file being written. Bytes go to a hidden temporary sibling of the final path,
/// which only appears once [`CacheFile::commit`] renames it into place. Dropping an
/// uncommitted file removes the temporary.
pub struct CacheFile {
    file: AsyncFile,
    temp_path: TempPath,
    final_path: PathBuf,
    written: u64,
}

impl CacheFile {
    /// Creates the parent directories and the temporary file. Failures carry the path.
    pub async fn create(final_path: &Path) -> Result<Self, ProxyError> {
        let parent = final_path.parent().ok_or_else(|| {
            ProxyError::cache_write(
                final_path,
                io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent"),
            )
        })?;
        async_fs::create_dir_all(parent)
            .await
            .map_err(|err| ProxyError::cache_write(parent, err))?;

        let prefix = format!(".{}.", file_name(final_path));
        let dir = parent.to_path_buf();
        let named = tokio::task::spawn_blocking(move || {
            TempBuilder::new()
                .prefix(&prefix)
                .suffix(".part")
                .tempfile_in(&dir)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|created| created)
        .map_err(|err| ProxyError::cache_write(parent, err))?;
        let (file, temp_path) = named.into_parts();
        trace!(path = %temp_path.display(), "opened cache temp file");
        Ok(Self {
            file: AsyncFile::from_std(file),
            temp_path,
            final_path: final_path.to_path_buf(),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes the body and atomically moves it to the final path, replacing any file a
    /// concurrent writer put there first.
    pub async fn commit(mut self) -> Result<PathBuf, ProxyError> {
        use tokio::io::AsyncWriteExt;

        self.file
            .flush()
            .await
            .map_err(|err| ProxyError::cache_write(&*self.temp_path, err))?;
        self.file
            .sync_data()
            .await
            .map_err(|err| ProxyError::cache_write(&*self.temp_path, err))?;
        let Self {
            file,
            temp_path,
            final_path,
            written,
        } = self;
        drop(file);
        let target = final_path.clone();
        tokio::task::spawn_blocking(move || temp_path.persist(&target).map_err(|err| err.error))
            .await
            .map_err(io::Error::other)
            .and_then(|persisted| persisted)
            .map_err(|err| ProxyError::cache_write(&final_path, err))?;
        debug!(
            path = %final_path.display(),
            bytes = written,
            "stored cache file"
        );
        Ok(final_path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl AsyncWrite for CacheFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.written = self.written.saturating_add(written as u64);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    async fn entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut read_dir = async_fs::read_dir(dir).await.expect("read dir");
        while let Some(entry) = read_dir.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn commit_moves_body_into_place() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("__POST/api/items.0000abcd");
        let mut file = CacheFile::create(&target).await?;
        file.write_all(b"payload").await?;
        assert!(!target.exists(), "final path must not exist before commit");
        assert_eq!(file.written(), 7);

        let stored = file.commit().await?;
        assert_eq!(stored, target);
        assert_eq!(async_fs::read(&target).await?, b"payload");
        assert_eq!(entries(&dir.path().join("__POST/api")).await, vec!["items.0000abcd"]);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_file_leaves_nothing_behind() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("page.html");
        {
            let mut file = CacheFile::create(&target).await?;
            file.write_all(b"trunc").await?;
            assert_eq!(entries(dir.path()).await.len(), 1);
        }
        assert!(entries(dir.path()).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_writers_use_separate_temporaries() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("shared.json");
        let mut first = CacheFile::create(&target).await?;
        let mut second = CacheFile::create(&target).await?;
        assert_eq!(entries(dir.path()).await.len(), 2);
        first.write_all(b"first").await?;
        second.write_all(b"second").await?;

        first.commit().await?;
        second.commit().await?;
        assert_eq!(async_fs::read(&target).await?, b"second");
        assert_eq!(entries(dir.path()).await, vec!["shared.json"]);
        Ok(())
    }

    #[tokio::test]
    async fn unwritable_parent_reports_cache_write_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        async_fs::write(dir.path().join("blocker"), b"file").await?;
        let err = match CacheFile::create(&dir.path().join("blocker/child")).await {
            Ok(_) => panic!("a file cannot be used as a directory"),
            Err(err) => err,
        };
        assert_eq!(err.reason(), "cache_write_error");
        Ok(())
    }
}
