use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tracing::warn;

use crate::utils::get_unique_filepath;

/// Filesystem operations the engine delegates.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Creates `path` if needed and sizes it to exactly `size` bytes.
    async fn preallocate(&self, path: &Path, size: u64) -> io::Result<()>;

    /// Moves a finished temp file to its destination and returns where it landed.
    async fn move_into_destination(
        &self,
        temp_path: &Path,
        suggested_name: &str,
        preferred_dir: Option<&Path>,
    ) -> io::Result<PathBuf>;

    /// Length of the file at `path`, or `None` when it does not exist.
    async fn file_len(&self, path: &Path) -> io::Result<Option<u64>>;

    async fn remove(&self, path: &Path) -> io::Result<()>;
}

pub struct LocalFileSystem {
    default_dir: PathBuf,
}

impl LocalFileSystem {
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn preallocate(&self, path: &Path, size: u64) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        if file.metadata().await?.len() != size {
            file.set_len(size).await?;
        }
        file.sync_all().await
    }

    async fn move_into_destination(
        &self,
        temp_path: &Path,
        suggested_name: &str,
        preferred_dir: Option<&Path>,
    ) -> io::Result<PathBuf> {
        let dir = preferred_dir.unwrap_or(&self.default_dir);
        fs::create_dir_all(dir).await?;
        let target = get_unique_filepath(dir, suggested_name);

        if let Err(rename_err) = fs::rename(temp_path, &target).await {
            // rename cannot cross filesystems; copy then drop the temp file
            warn!(error = %rename_err, "rename failed, copying instead");
            fs::copy(temp_path, &target).await?;
            fs::remove_file(temp_path).await?;
        }
        Ok(target)
    }

    async fn file_len(&self, path: &Path) -> io::Result<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
