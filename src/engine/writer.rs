use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// The single write path into an item's temp file.
///
/// Owned by the item's driver task, so writes from different segments are
/// applied one after another and never race on the descriptor. The file is
/// preallocated, so every write is an in-place overwrite at a known offset.
pub(crate) struct OutputFile {
    file: File,
    position: Option<u64>,
}

impl OutputFile {
    /// Opens an existing (preallocated) temp file.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path).await?;
        Ok(Self {
            file,
            position: None,
        })
    }

    /// Creates or opens `path` and cuts it to `len` bytes.
    pub async fn truncated(path: &Path, len: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        file.set_len(len).await?;
        Ok(Self {
            file,
            position: None,
        })
    }

    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if self.position != Some(offset) {
            self.position = None;
            self.file.seek(SeekFrom::Start(offset)).await?;
        }
        self.file.write_all(data).await?;
        self.position = Some(offset + data.len() as u64);
        Ok(())
    }

    pub async fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(len).await?;
        self.position = None;
        Ok(())
    }

    /// Pushes buffered bytes down to the disk.
    pub async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await
    }
}
