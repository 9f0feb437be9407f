//! Buffer I/O providers.
//!
//! A [`BufferDevice`] moves whole pages between memory and one backing
//! store. A [`MultipleBufferDevice`] multiplexes many devices behind
//! [`VirtualPageId`] addresses and is what the page buffer cache talks to.

pub mod file;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DeviceId, PageData, VirtualPageId};

pub use file::FileBufferDevice;
pub use memory::MemoryBufferDevice;

/// Page I/O against a single backing store.
#[async_trait]
pub trait BufferDevice: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Number of pages currently allocated on the device.
    fn page_count(&self) -> u32;

    async fn open(&self) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;

    async fn load_buffer(&self, physical_page_id: u32, buf: &mut PageData) -> StorageResult<()>;

    async fn save_buffer(&self, physical_page_id: u32, buf: &PageData) -> StorageResult<()>;

    async fn flush_buffers(&self, flush_reads: bool, flush_writes: bool) -> StorageResult<()>;
}

/// Page I/O across every device known to the cache.
#[async_trait]
pub trait MultipleBufferDevice: Send + Sync {
    /// Registers a device. A `DeviceId::UNASSIGNED` id asks for the lowest
    /// free id; the id actually used is returned.
    async fn add_device(
        &self,
        name: &str,
        path: &Path,
        device_id: DeviceId,
        create_page_count: u32,
    ) -> StorageResult<DeviceId>;

    async fn remove_device(&self, device_id: DeviceId) -> StorageResult<()>;

    async fn load_buffer(&self, page_id: VirtualPageId, buf: &mut PageData) -> StorageResult<()>;

    async fn save_buffer(&self, page_id: VirtualPageId, buf: &PageData) -> StorageResult<()>;

    async fn flush_buffers(
        &self,
        flush_reads: bool,
        flush_writes: bool,
        device_id: DeviceId,
    ) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

/// Which concrete device `DeviceSet::add_device` creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    File,
    Memory,
}

/// Registry of devices keyed by id.
pub struct DeviceSet {
    kind: DeviceKind,
    devices: DashMap<DeviceId, Arc<dyn BufferDevice>>,
    // Serializes id assignment and device creation.
    registration: tokio::sync::Mutex<()>,
}

impl DeviceSet {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            devices: DashMap::new(),
            registration: tokio::sync::Mutex::new(()),
        }
    }

    /// Registers an already constructed device under an explicit id.
    pub async fn attach(
        &self,
        device_id: DeviceId,
        device: Arc<dyn BufferDevice>,
    ) -> StorageResult<DeviceId> {
        let _registration = self.registration.lock().await;
        let device_id = self.resolve_id(device_id)?;
        device.open().await?;
        self.devices.insert(device_id, device);
        Ok(device_id)
    }

    pub fn device(&self, device_id: DeviceId) -> StorageResult<Arc<dyn BufferDevice>> {
        self.devices
            .get(&device_id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::DeviceNotFound(device_id))
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    fn resolve_id(&self, device_id: DeviceId) -> StorageResult<DeviceId> {
        if !device_id.is_unassigned() {
            if self.devices.contains_key(&device_id) {
                return Err(StorageError::DeviceExists(device_id));
            }
            return Ok(device_id);
        }

        (1..=u16::MAX)
            .map(DeviceId)
            .find(|id| !self.devices.contains_key(id))
            .ok_or_else(|| StorageError::Other("no free device id".to_string()))
    }

    async fn create_device(
        &self,
        name: &str,
        path: &Path,
        create_page_count: u32,
    ) -> StorageResult<Arc<dyn BufferDevice>> {
        let device: Arc<dyn BufferDevice> = match self.kind {
            DeviceKind::Memory => Arc::new(MemoryBufferDevice::new(name, create_page_count)),
            DeviceKind::File => {
                let path: PathBuf = path.to_path_buf();
                if create_page_count > 0 || !tokio::fs::try_exists(&path).await? {
                    Arc::new(FileBufferDevice::create(name, &path, create_page_count).await?)
                } else {
                    Arc::new(FileBufferDevice::open_existing(name, &path).await?)
                }
            }
        };
        Ok(device)
    }
}

#[async_trait]
impl MultipleBufferDevice for DeviceSet {
    async fn add_device(
        &self,
        name: &str,
        path: &Path,
        device_id: DeviceId,
        create_page_count: u32,
    ) -> StorageResult<DeviceId> {
        let _registration = self.registration.lock().await;
        let device_id = self.resolve_id(device_id)?;

        let device = self.create_device(name, path, create_page_count).await?;
        device.open().await?;
        self.devices.insert(device_id, device);

        info!("Added device {} '{}' ({})", device_id, name, path.display());
        Ok(device_id)
    }

    async fn remove_device(&self, device_id: DeviceId) -> StorageResult<()> {
        let _registration = self.registration.lock().await;
        let (_, device) = self
            .devices
            .remove(&device_id)
            .ok_or(StorageError::DeviceNotFound(device_id))?;
        device.close().await?;

        info!("Removed device {} '{}'", device_id, device.name());
        Ok(())
    }

    async fn load_buffer(&self, page_id: VirtualPageId, buf: &mut PageData) -> StorageResult<()> {
        let device = self.device(page_id.device_id())?;
        device.load_buffer(page_id.physical_page_id(), buf).await
    }

    async fn save_buffer(&self, page_id: VirtualPageId, buf: &PageData) -> StorageResult<()> {
        let device = self.device(page_id.device_id())?;
        device.save_buffer(page_id.physical_page_id(), buf).await
    }

    async fn flush_buffers(
        &self,
        flush_reads: bool,
        flush_writes: bool,
        device_id: DeviceId,
    ) -> StorageResult<()> {
        let device = self.device(device_id)?;
        device.flush_buffers(flush_reads, flush_writes).await
    }

    async fn close(&self) -> StorageResult<()> {
        let devices: Vec<(DeviceId, Arc<dyn BufferDevice>)> = self
            .devices
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.devices.clear();

        for (device_id, device) in devices {
            debug!("Closing device {}", device_id);
            device.close().await?;
        }
        Ok(())
    }
}
