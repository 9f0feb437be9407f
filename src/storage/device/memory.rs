use async_trait::async_trait;
use log::trace;
use parking_lot::Mutex;

use super::BufferDevice;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageData;
use crate::storage::PAGE_SIZE;

/// Volatile device used for temporary databases and tests.
#[derive(Debug)]
pub struct MemoryBufferDevice {
    name: String,
    pages: Mutex<Vec<Box<PageData>>>,
}

impl MemoryBufferDevice {
    pub fn new(name: &str, create_page_count: u32) -> Self {
        let pages = (0..create_page_count)
            .map(|_| Box::new([0u8; PAGE_SIZE]))
            .collect();
        Self {
            name: name.to_string(),
            pages: Mutex::new(pages),
        }
    }
}

#[async_trait]
impl BufferDevice for MemoryBufferDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn page_count(&self) -> u32 {
        self.pages.lock().len() as u32
    }

    async fn open(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_buffer(&self, physical_page_id: u32, buf: &mut PageData) -> StorageResult<()> {
        let pages = self.pages.lock();
        let page = pages.get(physical_page_id as usize).ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("page {} does not exist in {}", physical_page_id, self.name),
            ))
        })?;
        buf.copy_from_slice(&page[..]);
        trace!("{}: loaded page {}", self.name, physical_page_id);
        Ok(())
    }

    async fn save_buffer(&self, physical_page_id: u32, buf: &PageData) -> StorageResult<()> {
        let mut pages = self.pages.lock();
        let index = physical_page_id as usize;
        while pages.len() <= index {
            pages.push(Box::new([0u8; PAGE_SIZE]));
        }
        pages[index].copy_from_slice(&buf[..]);
        trace!("{}: saved page {}", self.name, physical_page_id);
        Ok(())
    }

    async fn flush_buffers(&self, _flush_reads: bool, _flush_writes: bool) -> StorageResult<()> {
        Ok(())
    }
}
