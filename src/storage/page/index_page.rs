//! Generic B-tree index page.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0   page type (0x02)     1  index type bits
//! 2   object id u32        6  index id u32
//! 10  left logical u64     18 right logical u64
//! 26  parent logical u64   34 depth u8
//! 35  reserved             36 entry count u16
//! 38  reserved u16         40 entries, ascending
//! ```

use std::time::Duration;

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use log::trace;

use super::index_info::IndexInfo;
use super::{IndexId, LogicalPageId, ObjectId, PageData, VirtualPageId};
use crate::concurrency::lock::{DatabaseLockManager, LockMode};
use crate::storage::buffer::PageBufferGuard;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PAGE_SIZE;
use crate::transaction::id::TransactionId;

pub const INDEX_HEADER_SIZE: usize = 40;
pub const INDEX_PAGE_TYPE: u8 = 0x02;

bitflags! {
    /// Position of a page within its index. A single-page index is
    /// `ROOT | LEAF`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IndexType: u8 {
        const ROOT = 0b001;
        const INTERMEDIATE = 0b010;
        const LEAF = 0b100;
    }
}

/// What `lock` acquired, so `unlock` can release exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldLock {
    Root { writable: bool },
    Internal { logical_id: LogicalPageId, writable: bool },
    Data { logical_id: LogicalPageId, mode: LockMode },
}

impl HeldLock {
    fn allows_writes(&self) -> bool {
        match self {
            HeldLock::Root { writable } | HeldLock::Internal { writable, .. } => *writable,
            HeldLock::Data { mode, .. } => mode.is_writable(),
        }
    }
}

fn check_leaf_depth(
    index_type: IndexType,
    depth: u8,
    page: impl std::fmt::Display,
) -> StorageResult<()> {
    if index_type.contains(IndexType::LEAF) && depth != 0 {
        return Err(StorageError::InvariantViolation(format!(
            "leaf page {} cannot have depth {}",
            page, depth
        )));
    }
    Ok(())
}

/// In-memory image of one index page holding entries of type `E`.
#[derive(Debug, Clone)]
pub struct IndexPage<E> {
    virtual_id: VirtualPageId,
    logical_id: LogicalPageId,
    object_id: ObjectId,
    index_id: IndexId,
    index_type: IndexType,
    depth: u8,
    left: LogicalPageId,
    right: LogicalPageId,
    parent: LogicalPageId,
    entries: Vec<E>,
    header_dirty: bool,
    data_dirty: bool,
    held_lock: Option<(TransactionId, HeldLock)>,
}

impl<E: IndexInfo> IndexPage<E> {
    /// A new, empty page. Leaf pages must have depth 0.
    pub fn new(
        virtual_id: VirtualPageId,
        logical_id: LogicalPageId,
        object_id: ObjectId,
        index_id: IndexId,
        index_type: IndexType,
        depth: u8,
    ) -> StorageResult<Self> {
        check_leaf_depth(index_type, depth, logical_id)?;
        Ok(Self {
            virtual_id,
            logical_id,
            object_id,
            index_id,
            index_type,
            depth,
            left: LogicalPageId::ZERO,
            right: LogicalPageId::ZERO,
            parent: LogicalPageId::ZERO,
            entries: Vec::new(),
            header_dirty: true,
            data_dirty: true,
            held_lock: None,
        })
    }

    pub fn virtual_id(&self) -> VirtualPageId {
        self.virtual_id
    }

    pub fn logical_id(&self) -> LogicalPageId {
        self.logical_id
    }

    pub fn set_logical_id(&mut self, logical_id: LogicalPageId) {
        self.logical_id = logical_id;
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Fails without changing the page when a page above depth 0 would
    /// become a leaf.
    pub fn set_index_type(&mut self, index_type: IndexType) -> StorageResult<()> {
        check_leaf_depth(index_type, self.depth, self.logical_id)?;
        if self.index_type != index_type {
            self.index_type = index_type;
            self.header_dirty = true;
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.index_type.contains(IndexType::ROOT)
    }

    pub fn is_leaf(&self) -> bool {
        self.index_type.contains(IndexType::LEAF)
    }

    pub fn left_logical_page_id(&self) -> LogicalPageId {
        self.left
    }

    pub fn set_left_logical_page_id(&mut self, id: LogicalPageId) {
        if self.left != id {
            self.left = id;
            self.header_dirty = true;
        }
    }

    pub fn right_logical_page_id(&self) -> LogicalPageId {
        self.right
    }

    pub fn set_right_logical_page_id(&mut self, id: LogicalPageId) {
        if self.right != id {
            self.right = id;
            self.header_dirty = true;
        }
    }

    pub fn parent_logical_page_id(&self) -> LogicalPageId {
        self.parent
    }

    pub fn set_parent_logical_page_id(&mut self, id: LogicalPageId) {
        if self.parent != id {
            self.parent = id;
            self.header_dirty = true;
        }
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn entry_count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn is_header_dirty(&self) -> bool {
        self.header_dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.header_dirty || self.data_dirty
    }

    /// Bytes the page would occupy if written now.
    pub fn used_bytes(&self) -> usize {
        INDEX_HEADER_SIZE + self.entries.iter().map(E::encoded_len).sum::<usize>()
    }

    pub fn fits(&self, entry: &E) -> bool {
        self.entries.len() < u16::MAX as usize
            && self.used_bytes() + entry.encoded_len() <= PAGE_SIZE
    }

    /// Capacity of a page for fixed-size entry flavors.
    pub fn max_index_entries() -> Option<usize> {
        E::fixed_len()
            .filter(|len| *len > 0)
            .map(|len| ((PAGE_SIZE - INDEX_HEADER_SIZE) / len).min(u16::MAX as usize))
    }

    /// Inserts `link` in order, before any entries equal to it. Returns
    /// true when it became the lowest entry and the parent's link to this
    /// page must be refreshed.
    ///
    /// A page shared with other transactions must be locked for writing
    /// first; a page holding only a read lock rejects the insert. Unlocked
    /// pages are the caller's own, e.g. pages still being built.
    pub fn add_link_to_page(&mut self, link: E) -> StorageResult<bool> {
        if let Some((holder, held)) = self.held_lock {
            if !held.allows_writes() {
                return Err(StorageError::InvariantViolation(format!(
                    "index page {} is only read-locked by {}",
                    self.logical_id, holder
                )));
            }
        }
        if !self.fits(&link) {
            return Err(StorageError::InvariantViolation(format!(
                "index page {} has no room for {:?}",
                self.logical_id, link
            )));
        }

        let position = self
            .entries
            .iter()
            .position(|entry| link <= *entry)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, link);
        self.data_dirty = true;
        self.header_dirty = true;
        trace!(
            "Index page {}: link added at {} of {}",
            self.logical_id,
            position,
            self.entries.len()
        );
        Ok(position == 0)
    }

    pub fn add_link_to_child(&mut self, child: &IndexPage<E>) -> StorageResult<bool> {
        let link = E::link_to_page(child)?;
        self.add_link_to_page(link)
    }

    /// Decodes a page image.
    pub fn read_from(
        virtual_id: VirtualPageId,
        logical_id: LogicalPageId,
        data: &PageData,
    ) -> StorageResult<Self> {
        let mut header = &data[..INDEX_HEADER_SIZE];
        let page_type = header.get_u8();
        if page_type != INDEX_PAGE_TYPE {
            return Err(StorageError::Corrupt(format!(
                "{} has page type {:#04x}, expected an index page",
                virtual_id, page_type
            )));
        }
        let status = header.get_u8();
        let index_type = IndexType::from_bits(status).ok_or_else(|| {
            StorageError::Corrupt(format!("{} has index type bits {:#04x}", virtual_id, status))
        })?;
        let object_id = ObjectId(header.get_u32_le());
        let index_id = IndexId(header.get_u32_le());
        let left = LogicalPageId(header.get_u64_le());
        let right = LogicalPageId(header.get_u64_le());
        let parent = LogicalPageId(header.get_u64_le());
        let depth = header.get_u8();
        header.advance(1);
        let count = header.get_u16_le();
        if index_type.contains(IndexType::LEAF) && depth != 0 {
            return Err(StorageError::Corrupt(format!(
                "leaf page {} is stored with depth {}",
                virtual_id, depth
            )));
        }

        let mut body = &data[INDEX_HEADER_SIZE..];
        let entries = (0..count)
            .map(|_| E::decode(&mut body))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Self {
            virtual_id,
            logical_id,
            object_id,
            index_id,
            index_type,
            depth,
            left,
            right,
            parent,
            entries,
            header_dirty: false,
            data_dirty: false,
            held_lock: None,
        })
    }

    /// Encodes header and entries into `data`, refreshing the entry count.
    pub fn write_to(&self, data: &mut PageData) -> StorageResult<()> {
        let used = self.used_bytes();
        if used > PAGE_SIZE {
            return Err(StorageError::InvariantViolation(format!(
                "index page {} needs {} bytes",
                self.logical_id, used
            )));
        }

        let mut buf = &mut data[..];
        buf.put_u8(INDEX_PAGE_TYPE);
        buf.put_u8(self.index_type.bits());
        buf.put_u32_le(self.object_id.0);
        buf.put_u32_le(self.index_id.0);
        buf.put_u64_le(self.left.0);
        buf.put_u64_le(self.right.0);
        buf.put_u64_le(self.parent.0);
        buf.put_u8(self.depth);
        buf.put_u8(0);
        buf.put_u16_le(self.entry_count());
        buf.put_u16_le(0);
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        buf.put_bytes(0, PAGE_SIZE - used);
        Ok(())
    }

    /// Reads the page from a cached buffer.
    pub fn load(guard: &PageBufferGuard) -> StorageResult<Self> {
        let logical_id = guard.logical_id().unwrap_or(LogicalPageId::ZERO);
        guard.read(|data| Self::read_from(guard.page_id(), logical_id, data))?
    }

    /// Writes the page into a cached buffer, leaving the buffer dirty.
    pub fn save(&mut self, guard: &PageBufferGuard) -> StorageResult<()> {
        guard.write(|data| self.write_to(data))??;
        if !self.logical_id.is_zero() {
            guard.set_logical_id(self.logical_id);
        }
        self.header_dirty = false;
        self.data_dirty = false;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.held_lock.is_some()
    }

    /// Takes the lock matching this page's position in the index: the
    /// root lock, an internal page lock or a data lock for leaves.
    /// `writable` root and internal locks are taken for exclusive requests.
    pub async fn lock<L>(
        &mut self,
        lock_manager: &L,
        owner: TransactionId,
        page_lock: LockMode,
        timeout: Duration,
    ) -> StorageResult<()>
    where
        L: DatabaseLockManager + ?Sized,
    {
        if let Some((holder, _)) = self.held_lock {
            return Err(StorageError::InvariantViolation(format!(
                "index page {} is already locked by {}",
                self.logical_id, holder
            )));
        }

        let writable = page_lock.is_writable();
        let held = if self.is_root() {
            lock_manager
                .lock_root_index(owner, self.object_id, self.index_id, writable, timeout)
                .await?;
            HeldLock::Root { writable }
        } else if self.index_type.contains(IndexType::INTERMEDIATE) {
            lock_manager
                .lock_internal_index(
                    owner,
                    self.object_id,
                    self.index_id,
                    self.logical_id,
                    writable,
                    timeout,
                )
                .await?;
            HeldLock::Internal {
                logical_id: self.logical_id,
                writable,
            }
        } else {
            lock_manager
                .lock_data(owner, self.object_id, self.logical_id, page_lock, timeout)
                .await?;
            HeldLock::Data {
                logical_id: self.logical_id,
                mode: page_lock,
            }
        };
        self.held_lock = Some((owner, held));
        Ok(())
    }

    /// Releases whatever `lock` acquired. Does nothing if unlocked. If the
    /// release fails the page still records the lock.
    pub async fn unlock<L>(&mut self, lock_manager: &L) -> StorageResult<()>
    where
        L: DatabaseLockManager + ?Sized,
    {
        let Some((owner, held)) = self.held_lock else {
            return Ok(());
        };
        let released = match held {
            HeldLock::Root { writable } => {
                lock_manager
                    .unlock_root_index(owner, self.object_id, self.index_id, writable)
                    .await
            }
            HeldLock::Internal {
                logical_id,
                writable,
            } => {
                lock_manager
                    .unlock_internal_index(
                        owner,
                        self.object_id,
                        self.index_id,
                        logical_id,
                        writable,
                    )
                    .await
            }
            HeldLock::Data { logical_id, mode } => {
                lock_manager
                    .unlock_data(owner, self.object_id, logical_id, mode)
                    .await
            }
        };
        released?;
        self.held_lock = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::lock::{LockId, LockManager};
    use crate::storage::page::index_info::{ClusteredIndexInfo, RootIndexInfo};
    use crate::storage::page::DeviceId;
    use rand::seq::SliceRandom;

    type Page = IndexPage<ClusteredIndexInfo>;

    fn leaf(logical: u64) -> Page {
        IndexPage::new(
            VirtualPageId::new(DeviceId(1), logical as u32),
            LogicalPageId(logical),
            ObjectId(7),
            IndexId(1),
            IndexType::LEAF,
            0,
        )
        .unwrap()
    }

    fn entry(key: u32, page: u64) -> ClusteredIndexInfo {
        ClusteredIndexInfo::new(key.to_be_bytes().to_vec(), LogicalPageId(page))
    }

    #[test]
    fn test_leaf_depth_is_zero() {
        let result = Page::new(
            VirtualPageId::new(DeviceId(1), 1),
            LogicalPageId(1),
            ObjectId(1),
            IndexId(1),
            IndexType::ROOT | IndexType::LEAF,
            2,
        );
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[test]
    fn test_deep_page_cannot_become_leaf() {
        let mut page = Page::new(
            VirtualPageId::new(DeviceId(1), 2),
            LogicalPageId(2),
            ObjectId(1),
            IndexId(1),
            IndexType::INTERMEDIATE,
            2,
        )
        .unwrap();
        let mut data = [0u8; PAGE_SIZE];
        page.write_to(&mut data).unwrap();
        let mut page = Page::read_from(page.virtual_id(), page.logical_id(), &data).unwrap();

        let err = page.set_index_type(IndexType::LEAF).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        assert_eq!(page.index_type(), IndexType::INTERMEDIATE);
        assert!(!page.is_header_dirty());

        page.set_index_type(IndexType::ROOT).unwrap();
        assert!(page.is_root());
    }

    #[test]
    fn test_read_rejects_stored_leaf_with_depth() {
        let mut data = [0u8; PAGE_SIZE];
        leaf(3).write_to(&mut data).unwrap();
        data[34] = 1;

        let err = Page::read_from(VirtualPageId::new(DeviceId(1), 3), LogicalPageId(3), &data)
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn test_shuffled_inserts_stay_sorted() {
        let mut keys: Vec<u32> = (0..200).collect();
        keys.shuffle(&mut rand::thread_rng());

        let mut page = leaf(1);
        let mut lowest = None;
        for key in keys {
            let update = page.add_link_to_page(entry(key, 1)).unwrap();
            let is_new_min = lowest.map_or(true, |low| key < low);
            assert_eq!(update, is_new_min, "key {}", key);
            if is_new_min {
                lowest = Some(key);
            }
        }

        assert_eq!(page.entry_count(), 200);
        assert!(page.entries().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_first_and_appended_links() {
        let mut page = leaf(1);
        assert!(page.add_link_to_page(entry(10, 1)).unwrap());
        assert!(!page.add_link_to_page(entry(20, 1)).unwrap());
        assert!(!page.add_link_to_page(entry(15, 1)).unwrap());
        assert!(page.add_link_to_page(entry(5, 1)).unwrap());
    }

    #[test]
    fn test_equal_entry_goes_before_existing() {
        let mut page = leaf(1);
        page.add_link_to_page(entry(10, 1)).unwrap();
        page.add_link_to_page(entry(20, 1)).unwrap();

        // Equal to the current minimum: inserted in front, parent must update
        assert!(page.add_link_to_page(entry(10, 1)).unwrap());
        assert_eq!(page.entry_count(), 3);
        assert_eq!(page.entries()[0], entry(10, 1));
        assert_eq!(page.entries()[1], entry(10, 1));
    }

    #[test]
    fn test_link_to_child_uses_lowest_entry() {
        let mut child = leaf(42);
        child.add_link_to_page(entry(300, 42)).unwrap();
        child.add_link_to_page(entry(100, 42)).unwrap();

        let mut parent = Page::new(
            VirtualPageId::new(DeviceId(1), 9),
            LogicalPageId(9),
            ObjectId(7),
            IndexId(1),
            IndexType::ROOT,
            1,
        )
        .unwrap();
        assert!(parent.add_link_to_child(&child).unwrap());
        assert_eq!(parent.entries()[0], entry(100, 42));
    }

    #[test]
    fn test_link_to_empty_child_fails_cleanly() {
        let child = leaf(42);
        let mut parent = Page::read_from(
            VirtualPageId::new(DeviceId(1), 9),
            LogicalPageId(9),
            &{
                let mut data = [0u8; PAGE_SIZE];
                leaf(9).write_to(&mut data).unwrap();
                data
            },
        )
        .unwrap();
        assert!(!parent.is_dirty());

        let err = parent.add_link_to_child(&child).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        assert_eq!(parent.entry_count(), 0);
        assert!(!parent.is_dirty());
    }

    #[test]
    fn test_full_page_rejects_link_without_mutation() {
        let mut page = leaf(1);
        let big = ClusteredIndexInfo::new(vec![7u8; 4000], LogicalPageId(1));
        page.add_link_to_page(big.clone()).unwrap();
        page.add_link_to_page(big.clone()).unwrap();
        assert!(!page.fits(&big));

        let before = page.entries().to_vec();
        assert!(page.add_link_to_page(big).is_err());
        assert_eq!(page.entries(), &before[..]);
    }

    #[test]
    fn test_setters_only_dirty_on_change() {
        let mut data = [0u8; PAGE_SIZE];
        let mut original = leaf(3);
        original.set_left_logical_page_id(LogicalPageId(2));
        original.write_to(&mut data).unwrap();

        let mut page = Page::read_from(original.virtual_id(), LogicalPageId(3), &data).unwrap();
        page.set_left_logical_page_id(LogicalPageId(2));
        page.set_index_type(IndexType::LEAF).unwrap();
        assert!(!page.is_header_dirty());

        page.set_right_logical_page_id(LogicalPageId(4));
        assert!(page.is_header_dirty());
        assert!(page.is_dirty());
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut page = leaf(5);
        page.set_index_type(IndexType::ROOT | IndexType::LEAF).unwrap();
        page.set_left_logical_page_id(LogicalPageId(4));
        page.set_right_logical_page_id(LogicalPageId(6));
        page.set_parent_logical_page_id(LogicalPageId(1));
        for key in [3u32, 1, 2] {
            page.add_link_to_page(entry(key, 5)).unwrap();
        }

        let mut data = [0xffu8; PAGE_SIZE];
        page.write_to(&mut data).unwrap();
        assert_eq!(data[0], INDEX_PAGE_TYPE);
        assert_eq!(data[1], 0b101);
        assert_eq!(&data[36..38], &3u16.to_le_bytes());
        assert!(data[page.used_bytes()..].iter().all(|b| *b == 0));

        let decoded = Page::read_from(page.virtual_id(), page.logical_id(), &data).unwrap();
        assert_eq!(decoded.entries(), page.entries());
        assert_eq!(decoded.index_type(), page.index_type());
        assert_eq!(decoded.left_logical_page_id(), LogicalPageId(4));
        assert_eq!(decoded.right_logical_page_id(), LogicalPageId(6));
        assert_eq!(decoded.parent_logical_page_id(), LogicalPageId(1));
        assert_eq!(decoded.object_id(), ObjectId(7));
        assert_eq!(decoded.index_id(), IndexId(1));
        assert_eq!(decoded.depth(), 0);
    }

    #[test]
    fn test_read_rejects_other_page_types() {
        let data = [0u8; PAGE_SIZE];
        let err = Page::read_from(VirtualPageId::new(DeviceId(1), 0), LogicalPageId(1), &data)
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[test]
    fn test_max_index_entries() {
        assert_eq!(Page::max_index_entries(), None);

        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
        struct Fixed(u64);

        impl IndexInfo for Fixed {
            fn encoded_len(&self) -> usize {
                8
            }
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.put_u64_le(self.0);
            }
            fn decode<B: Buf>(buf: &mut B) -> StorageResult<Self> {
                Ok(Fixed(buf.get_u64_le()))
            }
            fn link_to_page(child: &IndexPage<Self>) -> StorageResult<Self> {
                Ok(Fixed(child.logical_id().0))
            }
            fn fixed_len() -> Option<usize> {
                Some(8)
            }
        }

        assert_eq!(
            IndexPage::<Fixed>::max_index_entries(),
            Some((PAGE_SIZE - INDEX_HEADER_SIZE) / 8)
        );
        assert_eq!(RootIndexInfo::ENCODED_LEN, 38);
    }

    #[tokio::test]
    async fn test_leaf_lock_uses_data_lock() -> anyhow::Result<()> {
        let locks = LockManager::new();
        let mut page = leaf(8);
        let owner = TransactionId(1);

        page.lock(&locks, owner, LockMode::Exclusive, Duration::from_millis(50))
            .await?;
        assert!(page.is_locked());
        let data = LockId::Data(ObjectId(7), LogicalPageId(8));
        assert!(locks.has_lock(owner, &data, LockMode::Exclusive));
        assert!(page
            .lock(&locks, owner, LockMode::Shared, Duration::from_millis(50))
            .await
            .is_err());

        // A second owner times out until the page is unlocked
        let mut other = leaf(8);
        let err = other
            .lock(&locks, TransactionId(2), LockMode::Shared, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));

        page.unlock(&locks).await?;
        assert!(!locks.has_lock(owner, &data, LockMode::Exclusive));
        other
            .lock(&locks, TransactionId(2), LockMode::Shared, Duration::from_millis(50))
            .await?;
        other.unlock(&locks).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_root_lock_records_writable_mode() -> anyhow::Result<()> {
        let locks = LockManager::new();
        let owner = TransactionId(3);
        let mut root = Page::new(
            VirtualPageId::new(DeviceId(1), 1),
            LogicalPageId(1),
            ObjectId(7),
            IndexId(1),
            IndexType::ROOT,
            1,
        )?;

        root.lock(&locks, owner, LockMode::Exclusive, Duration::from_millis(50))
            .await?;
        let root_lock = LockId::RootIndex(ObjectId(7), IndexId(1));
        assert!(locks.has_lock(owner, &root_lock, LockMode::Exclusive));

        // Unlock releases the recorded lock even after the page changes role
        root.set_index_type(IndexType::INTERMEDIATE)?;
        root.unlock(&locks).await?;
        assert!(locks.get_transaction_locks(owner).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_lock_rejects_inserts() -> anyhow::Result<()> {
        let locks = LockManager::new();
        let timeout = Duration::from_millis(50);

        let mut page = leaf(8);
        page.lock(&locks, TransactionId(1), LockMode::Shared, timeout)
            .await?;
        let err = page.add_link_to_page(entry(1, 8)).unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        assert_eq!(page.entry_count(), 0);
        page.unlock(&locks).await?;

        page.lock(&locks, TransactionId(1), LockMode::Exclusive, timeout)
            .await?;
        assert!(page.add_link_to_page(entry(1, 8))?);
        page.unlock(&locks).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_unlock_keeps_lock_record() -> anyhow::Result<()> {
        let locks = LockManager::new();
        let owner = TransactionId(5);
        let timeout = Duration::from_millis(50);
        let mut page = leaf(8);

        page.lock(&locks, owner, LockMode::Exclusive, timeout).await?;
        // Released behind the page's back, so the page's own release fails
        locks.release_all_locks(owner);
        assert!(page.unlock(&locks).await.is_err());
        assert!(page.is_locked());

        let data = LockId::Data(ObjectId(7), LogicalPageId(8));
        locks
            .acquire_lock(owner, data.clone(), LockMode::Exclusive, timeout)
            .await?;
        page.unlock(&locks).await?;
        assert!(!page.is_locked());
        assert!(!locks.has_lock(owner, &data, LockMode::Exclusive));
        Ok(())
    }

    #[tokio::test]
    async fn test_intermediate_lock_is_per_page() -> anyhow::Result<()> {
        let locks = LockManager::new();
        let mut page = Page::new(
            VirtualPageId::new(DeviceId(1), 4),
            LogicalPageId(4),
            ObjectId(7),
            IndexId(1),
            IndexType::INTERMEDIATE,
            1,
        )?;

        page.lock(&locks, TransactionId(1), LockMode::Shared, Duration::from_millis(50))
            .await?;
        let internal = LockId::InternalIndex(ObjectId(7), IndexId(1), LogicalPageId(4));
        assert!(locks.has_lock(TransactionId(1), &internal, LockMode::Shared));
        page.unlock(&locks).await?;
        Ok(())
    }
}
