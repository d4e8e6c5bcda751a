//! Content-addressed-by-build-id blob storage on the filesystem, with
//! streaming I/O so a 1 GB result is never buffered whole in memory.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncWriteExt;

use crate::domain::{ArtifactKind, Platform};

/// A boxed byte stream, used instead of a generic parameter so
/// `ArtifactStore` stays object-safe (`Arc<dyn ArtifactStore>`).
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact exceeded its size limit of {limit} bytes")]
    SizeExceeded { limit: u64 },
    #[error("artifact not found")]
    NotFound,
    #[error("artifact path escapes the storage root")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Streams `reader` to disk under the build's subdirectory, enforcing
    /// `limit` bytes mid-stream, and returns the final relative path.
    /// Writes to a `.tmp.<pid>` temporary file first, then atomically
    /// renames into place.
    async fn put_stream(
        &self,
        kind: ArtifactKind,
        build_id: &str,
        platform: Platform,
        limit: u64,
        stream: ByteStream,
    ) -> Result<String, ArtifactError>;

    /// Opens a previously stored artifact for streaming download.
    async fn open_stream(
        &self,
        relative_path: &str,
    ) -> Result<tokio::fs::File, ArtifactError>;

    /// Best-effort recursive delete of a build's artifact directory.
    async fn delete_build_files(&self, build_id: &str);
}

#[derive(Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn build_dir(&self, build_id: &str) -> Result<PathBuf, ArtifactError> {
        path_safe_join(&self.root, build_id)
    }

    fn final_path(&self, build_id: &str, kind: ArtifactKind, platform: Platform) -> Result<PathBuf, ArtifactError> {
        path_safe_join(&self.build_dir(build_id)?, kind.file_name(platform))
    }
}

/// Rejects any component that would resolve outside of `root` (`..`,
/// absolute paths embedded in an otherwise relative-looking segment).
fn path_safe_join(root: &Path, segment: &str) -> Result<PathBuf, ArtifactError> {
    if segment.is_empty()
        || segment.contains("..")
        || Path::new(segment).is_absolute()
        || segment.contains('\0')
    {
        return Err(ArtifactError::InvalidPath);
    }
    Ok(root.join(segment))
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put_stream(
        &self,
        kind: ArtifactKind,
        build_id: &str,
        platform: Platform,
        limit: u64,
        mut stream: ByteStream,
    ) -> Result<String, ArtifactError> {
        use futures::StreamExt;

        let dir = self.build_dir(build_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = self.final_path(build_id, kind, platform)?;
        let tmp_path = dir.join(format!(
            "{}.tmp.{}",
            kind.file_name(platform),
            std::process::id()
        ));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > limit {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(ArtifactError::SizeExceeded { limit });
            }
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(final_path
            .strip_prefix(&self.root)
            .unwrap_or(&final_path)
            .to_string_lossy()
            .into_owned())
    }

    async fn open_stream(&self, relative_path: &str) -> Result<tokio::fs::File, ArtifactError> {
        let path = path_safe_join(&self.root, relative_path)?;
        tokio::fs::File::open(&path)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => ArtifactError::NotFound,
                _ => ArtifactError::Io(err),
            })
    }

    async fn delete_build_files(&self, build_id: &str) {
        if let Ok(dir) = self.build_dir(build_id) {
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(build_id, error = ?err, "failed to clean up artifact directory");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(data: &'static [u8], size: usize) -> impl Stream<Item = std::io::Result<Bytes>> {
        stream::iter(data.chunks(size).map(|c| Ok(Bytes::copy_from_slice(c))))
    }

    #[tokio::test]
    async fn put_then_open_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());

        let payload = b"hello from a worker upload";
        let path = store
            .put_stream(
                ArtifactKind::Source,
                "build-1",
                Platform::Ios,
                1024,
                Box::pin(chunks(payload, 4)),
            )
            .await
            .unwrap();

        let mut file = store.open_stream(&path).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn put_stream_rejects_overrun_and_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());

        let payload = vec![0u8; 2048];
        let err = store
            .put_stream(
                ArtifactKind::Result,
                "build-2",
                Platform::Android,
                1024,
                Box::pin(stream::iter(
                    payload
                        .chunks(256)
                        .map(|c| Ok(Bytes::copy_from_slice(c)))
                        .collect::<Vec<_>>(),
                )),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ArtifactError::SizeExceeded { limit: 1024 }));

        let mut entries = tokio::fs::read_dir(dir.path().join("build-2")).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let err = store.open_stream("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidPath));
    }
}
