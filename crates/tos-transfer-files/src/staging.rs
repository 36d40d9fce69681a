//! Staging files for downloads.
//!
//! Downloads are written into a staging file next to the destination and
//! published with a rename once every part has been written and verified.

use crate::STAGING_SUFFIX;
use async_trait::async_trait;
use std::io;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Staging path for a destination: `<dest>.temp`
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Sequential writer over one part of a staging file
#[async_trait]
pub trait PartWriter: Send {
    /// Append `data` after everything written so far
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the part; the writer must not be used afterwards
    async fn finish(&mut self) -> io::Result<()>;
}

/// Filesystem operations used by the download path
///
/// Durability is whatever the implementation contracts; the engine only
/// relies on a finished [`PartWriter`] being visible to a later `rename`.
#[async_trait]
pub trait StagingFs: Send + Sync {
    /// Create (or truncate) a staging file sized to `len` bytes
    async fn create(&self, path: &Path, len: u64) -> io::Result<()>;

    /// Check whether a staging file exists
    async fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Open a writer positioned at `offset`, kept open for a whole part
    async fn open_at(&self, path: &Path, offset: u64) -> io::Result<Box<dyn PartWriter>>;

    /// Write `data` at `offset` in one go
    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut writer = self.open_at(path, offset).await?;
        writer.write(data).await?;
        writer.finish().await
    }

    /// Atomically move the staging file to its destination
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Delete a staging file, ignoring a missing one
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Local filesystem staging through tokio
#[derive(Debug, Clone, Default)]
pub struct LocalStagingFs {
    sync_writes: bool,
}

impl LocalStagingFs {
    /// Create a staging filesystem that leaves flushing to the OS
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `sync_data` after every positional write
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }
}

#[async_trait]
impl StagingFs for LocalStagingFs {
    async fn create(&self, path: &Path, len: u64) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = fs::File::create(path).await?;
        file.set_len(len).await?;
        tracing::debug!("Created staging file {} ({} bytes)", path.display(), len);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        fs::try_exists(path).await
    }

    async fn open_at(&self, path: &Path, offset: u64) -> io::Result<Box<dyn PartWriter>> {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(LocalPartWriter {
            file,
            sync: self.sync_writes,
        }))
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await?;
        tracing::debug!("Renamed {} -> {}", from.display(), to.display());
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Open staging file handle for one part
#[derive(Debug)]
struct LocalPartWriter {
    file: File,
    sync: bool,
}

#[async_trait]
impl PartWriter for LocalPartWriter {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        if self.sync {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}
