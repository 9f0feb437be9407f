//! Logical ↔ virtual page indirection.
//!
//! Index links hold [`LogicalPageId`]s so pages can move between physical
//! locations without rewriting their parents. The table is a bijection.

use std::collections::HashMap;

use log::trace;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{LogicalPageId, VirtualPageId};

#[derive(Debug)]
struct Lookup {
    by_virtual: HashMap<VirtualPageId, LogicalPageId>,
    by_logical: HashMap<LogicalPageId, VirtualPageId>,
    /// `None` once `u64::MAX` has been handed out or mapped.
    next_logical: Option<u64>,
}

/// Persisted form of the table.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    next_logical: Option<u64>,
    entries: Vec<(VirtualPageId, LogicalPageId)>,
}

/// The later of two generator positions, where `None` is past the end.
fn later(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    Some(a?.max(b?))
}

#[derive(Debug)]
pub struct LogicalVirtualManager {
    lookup: RwLock<Lookup>,
}

impl Default for LogicalVirtualManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalVirtualManager {
    pub fn new() -> Self {
        Self {
            lookup: RwLock::new(Lookup {
                by_virtual: HashMap::new(),
                by_logical: HashMap::new(),
                next_logical: Some(1),
            }),
        }
    }

    /// Allocates an id that has never been returned or mapped.
    pub fn get_new_logical_page_id(&self) -> StorageResult<LogicalPageId> {
        let mut lookup = self.lookup.write();
        let id = lookup.next_logical.ok_or_else(|| {
            StorageError::InvariantViolation("logical page ids are exhausted".to_string())
        })?;
        lookup.next_logical = id.checked_add(1);
        Ok(LogicalPageId(id))
    }

    /// Maps `virtual_id` to `logical_id`. Re-adding the same pair is a no-op.
    pub fn add_lookup(
        &self,
        virtual_id: VirtualPageId,
        logical_id: LogicalPageId,
    ) -> StorageResult<()> {
        if logical_id.is_zero() {
            return Err(StorageError::InvariantViolation(format!(
                "{} cannot be mapped to {}",
                virtual_id, logical_id
            )));
        }

        let mut lookup = self.lookup.write();
        let existing_logical = lookup.by_virtual.get(&virtual_id).copied();
        let existing_virtual = lookup.by_logical.get(&logical_id).copied();
        match (existing_logical, existing_virtual) {
            (Some(l), Some(v)) if l == logical_id && v == virtual_id => return Ok(()),
            (None, None) => {}
            _ => {
                return Err(StorageError::DuplicateMapping {
                    virtual_id,
                    logical_id,
                })
            }
        }

        lookup.by_virtual.insert(virtual_id, logical_id);
        lookup.by_logical.insert(logical_id, virtual_id);
        lookup.next_logical = later(lookup.next_logical, logical_id.0.checked_add(1));
        trace!("Mapped {} <-> {}", virtual_id, logical_id);
        Ok(())
    }

    pub fn get_logical(&self, virtual_id: VirtualPageId) -> StorageResult<LogicalPageId> {
        self.lookup
            .read()
            .by_virtual
            .get(&virtual_id)
            .copied()
            .ok_or_else(|| StorageError::MappingNotFound(virtual_id.to_string()))
    }

    pub fn get_virtual(&self, logical_id: LogicalPageId) -> StorageResult<VirtualPageId> {
        self.lookup
            .read()
            .by_logical
            .get(&logical_id)
            .copied()
            .ok_or_else(|| StorageError::MappingNotFound(logical_id.to_string()))
    }

    /// Drops the mapping for `logical_id`. The id is not handed out again.
    pub fn remove_lookup(&self, logical_id: LogicalPageId) -> StorageResult<VirtualPageId> {
        let mut lookup = self.lookup.write();
        let virtual_id = lookup
            .by_logical
            .remove(&logical_id)
            .ok_or_else(|| StorageError::MappingNotFound(logical_id.to_string()))?;
        lookup.by_virtual.remove(&virtual_id);
        trace!("Unmapped {} <-> {}", virtual_id, logical_id);
        Ok(virtual_id)
    }

    pub fn len(&self) -> usize {
        self.lookup.read().by_logical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> StorageResult<Vec<u8>> {
        let snapshot = {
            let lookup = self.lookup.read();
            let mut entries: Vec<_> = lookup
                .by_virtual
                .iter()
                .map(|(virtual_id, logical_id)| (*virtual_id, *logical_id))
                .collect();
            entries.sort_by_key(|(_, logical_id)| *logical_id);
            Snapshot {
                next_logical: lookup.next_logical,
                entries,
            }
        };
        bincode::serialize(&snapshot)
            .map_err(|e| StorageError::Other(format!("Failed to encode lookup table: {}", e)))
    }

    pub fn restore(bytes: &[u8]) -> StorageResult<Self> {
        let snapshot: Snapshot = bincode::deserialize(bytes)
            .map_err(|e| StorageError::Corrupt(format!("lookup table: {}", e)))?;

        let manager = Self::new();
        for (virtual_id, logical_id) in snapshot.entries {
            manager.add_lookup(virtual_id, logical_id)?;
        }
        {
            let mut lookup = manager.lookup.write();
            lookup.next_logical = later(lookup.next_logical, snapshot.next_logical);
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::DeviceId;
    use std::collections::HashSet;

    fn vp(n: u32) -> VirtualPageId {
        VirtualPageId::new(DeviceId(1), n)
    }

    #[test]
    fn test_new_ids_are_unique_and_increasing() {
        let manager = LogicalVirtualManager::new();
        let first = manager.get_new_logical_page_id().unwrap();
        assert_eq!(first, LogicalPageId(1));

        let ids: Vec<_> = (0..100)
            .map(|_| manager.get_new_logical_page_id().unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids[0] > first);
    }

    #[test]
    fn test_bijection() {
        let manager = LogicalVirtualManager::new();
        manager.add_lookup(vp(10), LogicalPageId(3)).unwrap();
        manager.add_lookup(vp(11), LogicalPageId(4)).unwrap();

        assert_eq!(manager.get_logical(vp(10)).unwrap(), LogicalPageId(3));
        assert_eq!(manager.get_virtual(LogicalPageId(4)).unwrap(), vp(11));

        // Same pair again is fine
        manager.add_lookup(vp(10), LogicalPageId(3)).unwrap();
        assert_eq!(manager.len(), 2);

        // Either side already taken
        assert!(matches!(
            manager.add_lookup(vp(10), LogicalPageId(9)),
            Err(StorageError::DuplicateMapping { .. })
        ));
        assert!(matches!(
            manager.add_lookup(vp(12), LogicalPageId(4)),
            Err(StorageError::DuplicateMapping { .. })
        ));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_add_lookup_advances_generator() {
        let manager = LogicalVirtualManager::new();
        manager.add_lookup(vp(1), LogicalPageId(41)).unwrap();
        assert_eq!(manager.get_new_logical_page_id().unwrap(), LogicalPageId(42));
        assert!(manager.add_lookup(vp(2), LogicalPageId::ZERO).is_err());
    }

    #[test]
    fn test_highest_id_maps_and_exhausts_generator() {
        let manager = LogicalVirtualManager::new();
        let highest = LogicalPageId(u64::MAX);
        manager.add_lookup(vp(1), highest).unwrap();
        assert_eq!(manager.get_virtual(highest).unwrap(), vp(1));

        assert!(matches!(
            manager.get_new_logical_page_id(),
            Err(StorageError::InvariantViolation(_))
        ));
        // Lower ids can still be mapped explicitly
        manager.add_lookup(vp(2), LogicalPageId(5)).unwrap();
        assert!(manager.get_new_logical_page_id().is_err());

        let restored = LogicalVirtualManager::restore(&manager.snapshot().unwrap()).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.get_new_logical_page_id().is_err());
    }

    #[test]
    fn test_missing_and_removed_mappings() {
        let manager = LogicalVirtualManager::new();
        assert!(matches!(
            manager.get_logical(vp(5)),
            Err(StorageError::MappingNotFound(_))
        ));

        let logical = manager.get_new_logical_page_id().unwrap();
        manager.add_lookup(vp(5), logical).unwrap();
        assert_eq!(manager.remove_lookup(logical).unwrap(), vp(5));
        assert!(manager.get_virtual(logical).is_err());
        assert!(manager.get_logical(vp(5)).is_err());
        assert!(manager.remove_lookup(logical).is_err());
        assert_ne!(manager.get_new_logical_page_id().unwrap(), logical);
    }

    #[test]
    fn test_snapshot_restore() {
        let manager = LogicalVirtualManager::new();
        let mut logicals = HashSet::new();
        for n in 0..20 {
            let logical = manager.get_new_logical_page_id().unwrap();
            manager.add_lookup(vp(n), logical).unwrap();
            logicals.insert(logical);
        }
        let spare = manager.get_new_logical_page_id().unwrap();

        let restored = LogicalVirtualManager::restore(&manager.snapshot().unwrap()).unwrap();
        assert_eq!(restored.len(), 20);
        for n in 0..20 {
            let logical = restored.get_logical(vp(n)).unwrap();
            assert!(logicals.contains(&logical));
            assert_eq!(restored.get_virtual(logical).unwrap(), vp(n));
        }
        // Ids handed out before the snapshot are not reissued
        assert!(restored.get_new_logical_page_id().unwrap() > spare);

        assert!(LogicalVirtualManager::restore(&[1, 2, 3]).is_err());
    }
}
