//! Storage layer error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::storage::page::{DeviceId, LogicalPageId, VirtualPageId};

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Read of {page_id} timed out after {timeout:?}")]
    ReadTimeout {
        page_id: VirtualPageId,
        timeout: Duration,
    },

    #[error("Timed out after {timeout:?} waiting for {resource}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("No mapping found for {0}")]
    MappingNotFound(String),

    #[error("Mapping {virtual_id} <-> {logical_id} conflicts with an existing mapping")]
    DuplicateMapping {
        virtual_id: VirtualPageId,
        logical_id: LogicalPageId,
    },

    #[error("Device {0} is already registered")]
    DeviceExists(DeviceId),

    #[error("Device {0} is not registered")]
    DeviceNotFound(DeviceId),

    #[error("Device {device_id} still has {pinned} pinned page(s)")]
    DevicePinned { device_id: DeviceId, pinned: usize },

    #[error("Buffer cache is full: cannot allocate buffer for {0}")]
    CacheFull(VirtualPageId),

    #[error("Page buffer {page_id} cannot {operation} while {state}")]
    InvalidBufferState {
        page_id: VirtualPageId,
        state: &'static str,
        operation: &'static str,
    },

    #[error("Invalid log entry type: {0}")]
    InvalidLogEntryType(u8),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("{0} has been closed")]
    ObjectDisposed(&'static str),

    #[error("Page data is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Shared(Arc<StorageError>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl StorageError {
    /// True for errors the caller may retry, escalate or abort on.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::ReadTimeout { .. }
            | StorageError::LockTimeout { .. }
            | StorageError::MappingNotFound(_)
            | StorageError::DuplicateMapping { .. }
            | StorageError::DeviceExists(_)
            | StorageError::DevicePinned { .. }
            | StorageError::CacheFull(_) => true,
            StorageError::Shared(inner) => inner.is_recoverable(),
            _ => false,
        }
    }

    /// Unwraps errors that travelled through a shared load future.
    pub fn root(&self) -> &StorageError {
        match self {
            StorageError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<Arc<StorageError>> for StorageError {
    fn from(err: Arc<StorageError>) -> Self {
        StorageError::Shared(err)
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let timeout = StorageError::ReadTimeout {
            page_id: VirtualPageId::new(DeviceId(1), 4),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.is_recoverable());
        assert!(!StorageError::InvalidLogEntryType(42).is_recoverable());
        assert!(!StorageError::ObjectDisposed("PageBufferCache").is_recoverable());

        let shared = StorageError::Shared(Arc::new(timeout));
        assert!(shared.is_recoverable());
        assert!(matches!(shared.root(), StorageError::ReadTimeout { .. }));
    }
}
