use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use log::{debug, trace};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::BufferDevice;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageData;
use crate::storage::PAGE_SIZE;

/// A device backed by a single file, one `PAGE_SIZE` block per page.
///
/// Writes are not synced individually; `flush_buffers` with `flush_writes`
/// syncs the file so callers decide when data becomes durable.
#[derive(Debug)]
pub struct FileBufferDevice {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    page_count: AtomicU32,
}

impl FileBufferDevice {
    /// Creates (or truncates) the file and sizes it to `create_page_count` pages.
    pub async fn create(name: &str, path: &Path, create_page_count: u32) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        file.set_len(create_page_count as u64 * PAGE_SIZE as u64)
            .await?;

        debug!(
            "Created device file {} with {} page(s)",
            path.display(),
            create_page_count
        );
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_count: AtomicU32::new(create_page_count),
        })
    }

    /// Opens an existing device file.
    pub async fn open_existing(name: &str, path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        let len = file.metadata().await?.len();
        let page_count = (len / PAGE_SIZE as u64) as u32;

        debug!(
            "Opened device file {} with {} page(s)",
            path.display(),
            page_count
        );
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            file: Mutex::new(file),
            page_count: AtomicU32::new(page_count),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BufferDevice for FileBufferDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    async fn open(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let file = self.file.lock().await;
        file.sync_all().await?;
        Ok(())
    }

    async fn load_buffer(&self, physical_page_id: u32, buf: &mut PageData) -> StorageResult<()> {
        if physical_page_id >= self.page_count() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("page {} does not exist in {}", physical_page_id, self.name),
            )));
        }

        let offset = physical_page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf[..]).await?;

        trace!("{}: loaded page {}", self.name, physical_page_id);
        Ok(())
    }

    async fn save_buffer(&self, physical_page_id: u32, buf: &PageData) -> StorageResult<()> {
        // The page count must stay representable
        let page_count = physical_page_id.checked_add(1).ok_or_else(|| {
            StorageError::Other(format!(
                "page {} is beyond the addressable range of {}",
                physical_page_id, self.name
            ))
        })?;
        let offset = physical_page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.file.lock().await;

        // Extend file if necessary
        if physical_page_id >= self.page_count() {
            file.set_len(offset + PAGE_SIZE as u64).await?;
            self.page_count.store(page_count, Ordering::SeqCst);
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&buf[..]).await?;

        trace!("{}: saved page {}", self.name, physical_page_id);
        Ok(())
    }

    async fn flush_buffers(&self, _flush_reads: bool, flush_writes: bool) -> StorageResult<()> {
        if flush_writes {
            let mut file = self.file.lock().await;
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}
