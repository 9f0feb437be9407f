pub mod index_info;
pub mod index_page;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::PAGE_SIZE;

/// Identifies one backing device registered with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl DeviceId {
    /// Zero asks the device layer to assign an id.
    pub const UNASSIGNED: DeviceId = DeviceId(0);

    pub fn is_unassigned(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.0)
    }
}

/// Physical address of a page: the device plus the page offset within it.
///
/// Ordered by device first, then by page, and packed into a `u64` as
/// `device << 32 | page` wherever it is written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualPageId {
    device_id: DeviceId,
    physical_page_id: u32,
}

impl VirtualPageId {
    pub fn new(device_id: DeviceId, physical_page_id: u32) -> Self {
        Self {
            device_id,
            physical_page_id,
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            device_id: DeviceId(((value >> 32) & 0xffff) as u16),
            physical_page_id: (value & 0xffff_ffff) as u32,
        }
    }

    pub fn as_u64(&self) -> u64 {
        ((self.device_id.0 as u64) << 32) | self.physical_page_id as u64
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn physical_page_id(&self) -> u32 {
        self.physical_page_id
    }

    /// Byte offset of this page within its device.
    pub fn offset(&self) -> u64 {
        self.physical_page_id as u64 * PAGE_SIZE as u64
    }

    pub fn next_page(&self) -> Option<Self> {
        self.physical_page_id
            .checked_add(1)
            .map(|page| Self::new(self.device_id, page))
    }
}

impl fmt::Display for VirtualPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualPageId({:04X}:{:08X})",
            self.device_id.0, self.physical_page_id
        )
    }
}

/// Relocation-independent page identifier embedded in index links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogicalPageId(pub u64);

impl LogicalPageId {
    /// Sentinel for "no page" (unset sibling or parent links).
    pub const ZERO: LogicalPageId = LogicalPageId(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogicalPageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogicalPageId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct IndexId(pub u32);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Index({})", self.0)
    }
}

/// Raw page contents as held by a buffer slot.
pub type PageData = [u8; PAGE_SIZE];

pub use index_info::{
    ClusteredIndexInfo, IndexInfo, RootIndexInfo, RowLocator, UnclusteredIndexInfo,
};
pub use index_page::{IndexPage, IndexType, INDEX_HEADER_SIZE, INDEX_PAGE_TYPE};
