#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SegtaskError};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Binary file storage with bounded-memory streaming writes.
///
/// Writes land in a hidden scratch file beside the target and are renamed into
/// place once flushed and synced, so a reader that can open the final name
/// always sees the complete content.
#[derive(Debug, Clone)]
pub struct BlobStore {
    chunk_size: usize,
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl BlobStore {
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copies `reader` to `path` one chunk at a time and returns the byte count.
    pub async fn write_streamed<R>(&self, path: &Path, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.stage(path, reader).await?.publish().await
    }

    /// Streams `reader` into a synced scratch file beside `path` without making
    /// it visible. Nothing appears at `path` until [`StagedBlob::publish`].
    pub async fn stage<R>(&self, path: &Path, reader: &mut R) -> Result<StagedBlob>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tmp = scratch_path(path);
        match self.copy_into(&tmp, reader).await {
            Ok(bytes) => Ok(StagedBlob {
                tmp,
                target: path.to_path_buf(),
                bytes,
                published: false,
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn copy_into<R>(&self, tmp: &Path, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp)
            .await
            .map_err(SegtaskError::storage(tmp))?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(SegtaskError::Input)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .await
                .map_err(SegtaskError::storage(tmp))?;
            written += n as u64;
        }

        file.flush().await.map_err(SegtaskError::storage(tmp))?;
        file.sync_all().await.map_err(SegtaskError::storage(tmp))?;
        Ok(written)
    }

    /// Opens `path` for reading along with its exact length.
    pub async fn read_with_size(&self, path: &Path) -> Result<(File, u64)> {
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SegtaskError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(SegtaskError::storage(path)(e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(SegtaskError::storage(path))?
            .len();
        Ok((file, len))
    }
}

/// Fully written blob waiting to be renamed into place. Dropping it without
/// publishing removes the scratch file.
#[derive(Debug)]
pub struct StagedBlob {
    tmp: PathBuf,
    target: PathBuf,
    bytes: u64,
    published: bool,
}

impl StagedBlob {
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub async fn publish(mut self) -> Result<u64> {
        tokio::fs::rename(&self.tmp, &self.target)
            .await
            .map_err(SegtaskError::storage(&self.target))?;
        self.published = true;
        if let Some(parent) = self.target.parent() {
            sync_dir(parent).await?;
        }

        debug!(path = %self.target.display(), bytes = self.bytes, "blob written");
        Ok(self.bytes)
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

/// Unique hidden sibling of `target` used as the write-then-rename staging file.
pub(crate) fn scratch_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    target.with_file_name(format!(".{name}.{suffix}.tmp"))
}

/// Persists directory entries (renames) on platforms that allow syncing a directory.
pub(crate) async fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).await.map_err(SegtaskError::storage(dir))?;
        handle.sync_all().await.map_err(SegtaskError::storage(dir))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
