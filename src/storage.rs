//! Storage layer for stratadb.
//!
//! Pages are fixed-size (8KB) blocks addressed by a [`VirtualPageId`]
//! (device plus physical page). Key components:
//!
//! - **Device**: page-granular I/O against files or memory
//! - **PageBufferCache**: shared page buffers with deduplicated, batched loads
//! - **LogicalVirtualManager**: stable logical ids for relocatable pages
//! - **IndexPage**: sorted B-tree node layout over a page buffer

pub mod buffer;
pub mod device;
pub mod error;
pub mod logical;
pub mod page;

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 8192;

pub use buffer::{
    CacheConfig, CacheStats, CachingPageBufferDevice, FlushParams, PageBuffer, PageBufferCache,
    PageBufferGuard, PageBufferState,
};
pub use device::{BufferDevice, DeviceKind, DeviceSet, MultipleBufferDevice};
pub use error::{StorageError, StorageResult};
pub use logical::LogicalVirtualManager;
pub use page::{DeviceId, IndexId, LogicalPageId, ObjectId, PageData, VirtualPageId};
