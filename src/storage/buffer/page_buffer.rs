//! A single cached page and its load/save/dirty/free state machine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::{Mutex, RwLock};

use super::replacer::Replacer;
use crate::recovery::log_entry::{LogEntry, PageChange};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{LogicalPageId, PageData, VirtualPageId};
use crate::transaction::id::TransactionId;

/// Lifecycle of a page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBufferState {
    Free,
    PendingLoad,
    Loading,
    Allocated,
    Dirty,
    WritePending,
}

impl PageBufferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageBufferState::Free => "free",
            PageBufferState::PendingLoad => "pending load",
            PageBufferState::Loading => "loading",
            PageBufferState::Allocated => "allocated",
            PageBufferState::Dirty => "dirty",
            PageBufferState::WritePending => "write pending",
        }
    }
}

#[derive(Debug)]
struct BufferInner {
    state: PageBufferState,
    logical_id: Option<LogicalPageId>,
    is_new: bool,
    is_deleted: bool,
    /// Set when the page is written while a save is in flight.
    redirtied: bool,
    timestamp: i64,
    before_image: Option<Box<PageData>>,
}

/// One fixed-size page held by the cache.
///
/// Shared through `Arc` and borrowed through [`PageBufferGuard`]; the
/// reference count tracks live guards, not `Arc` clones.
#[derive(Debug)]
pub struct PageBuffer {
    page_id: VirtualPageId,
    data: RwLock<Box<PageData>>,
    inner: Mutex<BufferInner>,
    ref_count: AtomicUsize,
}

impl PageBuffer {
    /// Wraps a (possibly recycled) data block as a free buffer for `page_id`.
    pub fn new(page_id: VirtualPageId, block: Box<PageData>) -> Self {
        Self {
            page_id,
            data: RwLock::new(block),
            inner: Mutex::new(BufferInner {
                state: PageBufferState::Free,
                logical_id: None,
                is_new: false,
                is_deleted: false,
                redirtied: false,
                timestamp: 0,
                before_image: None,
            }),
            ref_count: AtomicUsize::new(0),
        }
    }

    pub fn page_id(&self) -> VirtualPageId {
        self.page_id
    }

    pub fn state(&self) -> PageBufferState {
        self.inner.lock().state
    }

    pub fn logical_id(&self) -> Option<LogicalPageId> {
        self.inner.lock().logical_id
    }

    pub fn set_logical_id(&self, logical_id: LogicalPageId) {
        self.inner.lock().logical_id = Some(logical_id);
    }

    pub fn timestamp(&self) -> i64 {
        self.inner.lock().timestamp
    }

    pub fn set_timestamp(&self, timestamp: i64) {
        self.inner.lock().timestamp = timestamp;
    }

    pub fn is_dirty(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == PageBufferState::Dirty || inner.redirtied
    }

    pub fn is_new(&self) -> bool {
        self.inner.lock().is_new
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().is_deleted
    }

    pub fn is_read_pending(&self) -> bool {
        matches!(
            self.state(),
            PageBufferState::PendingLoad | PageBufferState::Loading
        )
    }

    pub fn is_write_pending(&self) -> bool {
        self.state() == PageBufferState::WritePending
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Returns the new reference count.
    pub fn add_ref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the new reference count.
    pub fn release(&self) -> usize {
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Clean, unreferenced and not in flight.
    pub fn can_free(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == PageBufferState::Allocated
            && !inner.redirtied
            && self.ref_count.load(Ordering::SeqCst) == 0
    }

    fn invalid(&self, state: PageBufferState, operation: &'static str) -> StorageError {
        StorageError::InvalidBufferState {
            page_id: self.page_id,
            state: state.as_str(),
            operation,
        }
    }

    /// `Free -> Allocated` for a page that has never been written.
    pub fn init(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != PageBufferState::Free {
            return Err(self.invalid(inner.state, "init"));
        }
        self.data.write().fill(0);
        inner.state = PageBufferState::Allocated;
        inner.is_new = true;
        inner.is_deleted = false;
        inner.timestamp = 0;
        inner.before_image = None;
        trace!("{} initialised", self.page_id);
        Ok(())
    }

    /// `Free -> PendingLoad`
    pub fn request_load(&self) -> StorageResult<()> {
        self.transition(PageBufferState::Free, PageBufferState::PendingLoad, "request load")
    }

    /// `PendingLoad -> Loading`
    pub fn begin_load(&self) -> StorageResult<()> {
        self.transition(PageBufferState::PendingLoad, PageBufferState::Loading, "begin load")
    }

    /// `Loading -> Allocated`, swapping in the block the device filled.
    /// Returns the block it replaced so the caller can recycle it.
    pub fn complete_load(&self, block: Box<PageData>) -> StorageResult<Box<PageData>> {
        let mut inner = self.inner.lock();
        if inner.state != PageBufferState::Loading {
            return Err(self.invalid(inner.state, "complete load"));
        }
        let previous = std::mem::replace(&mut *self.data.write(), block);
        inner.state = PageBufferState::Allocated;
        inner.is_new = false;
        trace!("{} loaded", self.page_id);
        Ok(previous)
    }

    /// Back to `Free` after a failed read.
    pub fn fail_load(&self) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            PageBufferState::PendingLoad | PageBufferState::Loading
        ) {
            inner.state = PageBufferState::Free;
        }
    }

    /// `Allocated -> Dirty`; also re-dirties a buffer whose save is in flight.
    pub fn set_dirty(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            PageBufferState::Allocated => inner.state = PageBufferState::Dirty,
            PageBufferState::Dirty => {}
            PageBufferState::WritePending => inner.redirtied = true,
            state => return Err(self.invalid(state, "set dirty")),
        }
        Ok(())
    }

    /// `Dirty -> WritePending`, returning a snapshot of the bytes to write.
    pub fn begin_save(&self) -> StorageResult<Box<PageData>> {
        let mut inner = self.inner.lock();
        if inner.state != PageBufferState::Dirty {
            return Err(self.invalid(inner.state, "begin save"));
        }
        inner.state = PageBufferState::WritePending;
        inner.redirtied = false;
        Ok(Box::new(**self.data.read()))
    }

    /// `WritePending -> Allocated`, or back to `Dirty` if written meanwhile.
    pub fn complete_save(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != PageBufferState::WritePending {
            return Err(self.invalid(inner.state, "complete save"));
        }
        inner.state = if inner.redirtied {
            PageBufferState::Dirty
        } else {
            PageBufferState::Allocated
        };
        inner.redirtied = false;
        inner.is_new = false;
        trace!("{} saved", self.page_id);
        Ok(())
    }

    /// Back to `Dirty` after a failed write.
    pub fn fail_save(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PageBufferState::WritePending {
            inner.state = PageBufferState::Dirty;
            inner.redirtied = false;
        }
    }

    /// `Allocated -> Free`. Only legal for a clean, unreferenced buffer.
    pub fn set_free(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != PageBufferState::Allocated
            || inner.redirtied
            || self.ref_count.load(Ordering::SeqCst) != 0
        {
            return Err(self.invalid(inner.state, "free"));
        }
        inner.state = PageBufferState::Free;
        inner.logical_id = None;
        inner.before_image = None;
        Ok(())
    }

    /// Releases the data block of a buffer nobody else can reach.
    pub fn into_block(self) -> Box<PageData> {
        self.data.into_inner()
    }

    fn transition(
        &self,
        from: PageBufferState,
        to: PageBufferState,
        operation: &'static str,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != from {
            return Err(self.invalid(inner.state, operation));
        }
        inner.state = to;
        Ok(())
    }

    fn check_readable(&self, inner: &BufferInner, operation: &'static str) -> StorageResult<()> {
        match inner.state {
            PageBufferState::Allocated
            | PageBufferState::Dirty
            | PageBufferState::WritePending => Ok(()),
            state => Err(self.invalid(state, operation)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&PageData) -> R) -> StorageResult<R> {
        {
            let inner = self.inner.lock();
            self.check_readable(&inner, "read")?;
        }
        let data = self.data.read();
        Ok(f(&data))
    }

    /// Mutates the page. The first write after a commit captures the
    /// before-image; the buffer is marked dirty.
    pub fn write<R>(&self, f: impl FnOnce(&mut PageData) -> R) -> StorageResult<R> {
        let mut inner = self.inner.lock();
        self.check_readable(&inner, "write")?;

        let mut data = self.data.write();
        if inner.before_image.is_none() {
            inner.before_image = Some(Box::new(**data));
        }
        let result = f(&mut data);
        drop(data);

        match inner.state {
            PageBufferState::Allocated => inner.state = PageBufferState::Dirty,
            PageBufferState::WritePending => inner.redirtied = true,
            _ => {}
        }
        Ok(result)
    }

    /// Overwrites the page with a logged image during recovery.
    pub fn apply_image(&self, image: &PageData, timestamp: i64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.check_readable(&inner, "apply image")?;
        self.data.write().copy_from_slice(image);
        inner.timestamp = timestamp;
        match inner.state {
            PageBufferState::Allocated => inner.state = PageBufferState::Dirty,
            PageBufferState::WritePending => inner.redirtied = true,
            _ => {}
        }
        Ok(())
    }

    /// Marks the page deleted; its current contents become the before-image.
    pub fn set_deleted(&self) -> StorageResult<()> {
        self.write(|_| ())?;
        self.inner.lock().is_deleted = true;
        Ok(())
    }

    pub fn has_pending_changes(&self) -> bool {
        let inner = self.inner.lock();
        inner.before_image.is_some() || inner.is_deleted
    }

    /// Turns the changes made since the last commit into a log entry.
    ///
    /// Returns `None` when the page was not touched. The entry carries no
    /// log ids yet; `TransactionLog` assigns them when it is appended.
    pub fn commit(
        &self,
        transaction_id: TransactionId,
        timestamp: i64,
    ) -> StorageResult<Option<LogEntry>> {
        let mut inner = self.inner.lock();
        self.check_readable(&inner, "commit")?;

        // Created and deleted by the same transaction: nothing to replay
        if inner.is_new && inner.is_deleted {
            inner.before_image = None;
            inner.is_new = false;
            inner.is_deleted = false;
            inner.timestamp = timestamp;
            trace!("{} created and deleted by {}", self.page_id, transaction_id);
            return Ok(None);
        }

        let before = match inner.before_image.take() {
            Some(before) => before,
            None if inner.is_deleted => Box::new(**self.data.read()),
            None => return Ok(None),
        };
        let after = Box::new(**self.data.read());
        let image = PageChange {
            transaction_id,
            virtual_page_id: self.page_id,
            timestamp,
        };

        let entry = if inner.is_new {
            LogEntry::create_page(image, after)
        } else if inner.is_deleted {
            LogEntry::delete_page(image, before)
        } else {
            LogEntry::modify_page(image, before, after)
        };

        inner.is_new = false;
        inner.is_deleted = false;
        inner.timestamp = timestamp;
        trace!("{} committed by {} at {}", self.page_id, transaction_id, timestamp);
        Ok(Some(entry))
    }

    /// Restores the before-image captured by the first write since the
    /// last commit.
    pub fn rollback(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.is_deleted = false;
        if let Some(before) = inner.before_image.take() {
            self.data.write().copy_from_slice(&before[..]);
            trace!("{} rolled back", self.page_id);
        }
        Ok(())
    }
}

/// RAII borrow of a cached page buffer.
///
/// Creating a guard takes a reference; dropping it releases the reference
/// and, once the count reaches zero, makes the page evictable again.
pub struct PageBufferGuard {
    buffer: Arc<PageBuffer>,
    replacer: Option<Arc<Mutex<Box<dyn Replacer>>>>,
}

impl PageBufferGuard {
    pub(crate) fn new(
        buffer: Arc<PageBuffer>,
        replacer: Option<Arc<Mutex<Box<dyn Replacer>>>>,
    ) -> Self {
        if buffer.add_ref() == 1 {
            if let Some(replacer) = &replacer {
                replacer.lock().pin(buffer.page_id());
            }
        }
        Self { buffer, replacer }
    }

    /// A guard that is not tracked by any cache.
    pub fn detached(buffer: Arc<PageBuffer>) -> Self {
        Self::new(buffer, None)
    }

    pub fn buffer(&self) -> &Arc<PageBuffer> {
        &self.buffer
    }
}

impl Clone for PageBufferGuard {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.buffer), self.replacer.clone())
    }
}

impl std::ops::Deref for PageBufferGuard {
    type Target = PageBuffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::fmt::Debug for PageBufferGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBufferGuard")
            .field("page_id", &self.buffer.page_id())
            .field("ref_count", &self.buffer.ref_count())
            .finish()
    }
}

impl Drop for PageBufferGuard {
    fn drop(&mut self) {
        if self.buffer.release() == 0 {
            if let Some(replacer) = &self.replacer {
                replacer.lock().unpin(self.buffer.page_id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::log_entry::LogEntryKind;
    use crate::storage::page::DeviceId;
    use crate::storage::PAGE_SIZE;

    fn page_id() -> VirtualPageId {
        VirtualPageId::new(DeviceId(1), 7)
    }

    fn allocated() -> PageBuffer {
        let buffer = PageBuffer::new(page_id(), Box::new([0u8; PAGE_SIZE]));
        buffer.request_load().unwrap();
        buffer.begin_load().unwrap();
        let mut block = Box::new([0u8; PAGE_SIZE]);
        block[0] = 1;
        buffer.complete_load(block).unwrap();
        buffer
    }

    #[test]
    fn test_load_state_machine() {
        let buffer = PageBuffer::new(page_id(), Box::new([0u8; PAGE_SIZE]));
        assert_eq!(buffer.state(), PageBufferState::Free);
        assert!(buffer.read(|_| ()).is_err());

        buffer.request_load().unwrap();
        assert!(buffer.is_read_pending());
        assert!(buffer.read(|_| ()).is_err());
        assert!(buffer.request_load().is_err());

        buffer.begin_load().unwrap();
        let mut block = Box::new([0u8; PAGE_SIZE]);
        block[3] = 9;
        buffer.complete_load(block).unwrap();
        assert_eq!(buffer.state(), PageBufferState::Allocated);
        assert_eq!(buffer.read(|data| data[3]).unwrap(), 9);
    }

    #[test]
    fn test_failed_load_returns_to_free() {
        let buffer = PageBuffer::new(page_id(), Box::new([0u8; PAGE_SIZE]));
        buffer.request_load().unwrap();
        buffer.begin_load().unwrap();
        buffer.fail_load();
        assert_eq!(buffer.state(), PageBufferState::Free);
    }

    #[test]
    fn test_save_cycle() {
        let buffer = allocated();
        assert!(buffer.begin_save().is_err());

        buffer.write(|data| data[0] = 2).unwrap();
        assert!(buffer.is_dirty());

        let snapshot = buffer.begin_save().unwrap();
        assert_eq!(snapshot[0], 2);
        assert!(buffer.is_write_pending());

        buffer.complete_save().unwrap();
        assert_eq!(buffer.state(), PageBufferState::Allocated);
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn test_write_during_save_stays_dirty() {
        let buffer = allocated();
        buffer.set_dirty().unwrap();
        let _snapshot = buffer.begin_save().unwrap();

        buffer.write(|data| data[0] = 5).unwrap();
        buffer.complete_save().unwrap();
        assert_eq!(buffer.state(), PageBufferState::Dirty);
    }

    #[test]
    fn test_free_requires_clean_unreferenced() {
        let buffer = allocated();
        buffer.add_ref();
        assert!(buffer.set_free().is_err());
        buffer.release();

        buffer.set_dirty().unwrap();
        assert!(!buffer.can_free());
        assert!(matches!(
            buffer.set_free(),
            Err(StorageError::InvalidBufferState { .. })
        ));

        let _ = buffer.begin_save().unwrap();
        buffer.complete_save().unwrap();
        assert!(buffer.can_free());
        buffer.set_free().unwrap();
        assert_eq!(buffer.state(), PageBufferState::Free);
    }

    #[test]
    fn test_commit_produces_modify_entry() {
        let buffer = allocated();
        assert!(buffer.commit(TransactionId(1), 10).unwrap().is_none());

        buffer.write(|data| data[0] = 42).unwrap();
        let entry = buffer.commit(TransactionId(1), 10).unwrap().unwrap();
        assert_eq!(entry.kind(), LogEntryKind::ModifyPage);
        assert_eq!(entry.before_image().unwrap()[0], 1);
        assert_eq!(entry.after_image().unwrap()[0], 42);
        assert_eq!(buffer.timestamp(), 10);
        assert!(!buffer.has_pending_changes());
    }

    #[test]
    fn test_commit_new_and_deleted_pages() {
        let buffer = PageBuffer::new(page_id(), Box::new([0u8; PAGE_SIZE]));
        buffer.init().unwrap();
        buffer.write(|data| data[1] = 3).unwrap();
        let entry = buffer.commit(TransactionId(2), 1).unwrap().unwrap();
        assert_eq!(entry.kind(), LogEntryKind::CreatePage);

        buffer.set_deleted().unwrap();
        let entry = buffer.commit(TransactionId(2), 2).unwrap().unwrap();
        assert_eq!(entry.kind(), LogEntryKind::DeletePage);
        assert_eq!(entry.before_image().unwrap()[1], 3);
    }

    #[test]
    fn test_committed_delete_is_logged_once() {
        let buffer = allocated();
        buffer.set_deleted().unwrap();
        let entry = buffer.commit(TransactionId(1), 5).unwrap().unwrap();
        assert_eq!(entry.kind(), LogEntryKind::DeletePage);
        assert!(!buffer.is_deleted());
        assert!(!buffer.has_pending_changes());

        assert!(buffer.commit(TransactionId(2), 6).unwrap().is_none());
    }

    #[test]
    fn test_create_then_delete_logs_nothing() {
        let buffer = PageBuffer::new(page_id(), Box::new([0u8; PAGE_SIZE]));
        buffer.init().unwrap();
        buffer.write(|data| data[1] = 3).unwrap();
        buffer.set_deleted().unwrap();

        assert!(buffer.commit(TransactionId(4), 1).unwrap().is_none());
        assert!(!buffer.is_new());
        assert!(!buffer.is_deleted());
        assert!(!buffer.has_pending_changes());
    }

    #[test]
    fn test_rollback_restores_before_image() {
        let buffer = allocated();
        buffer.write(|data| data[0] = 99).unwrap();
        buffer.write(|data| data[1] = 98).unwrap();

        buffer.rollback().unwrap();
        assert_eq!(buffer.read(|data| (data[0], data[1])).unwrap(), (1, 0));
        assert!(!buffer.has_pending_changes());
    }

    #[test]
    fn test_guard_balances_ref_count() {
        let buffer = Arc::new(allocated());
        {
            let guard = PageBufferGuard::detached(Arc::clone(&buffer));
            let second = guard.clone();
            assert_eq!(buffer.ref_count(), 2);
            drop(second);
            assert_eq!(guard.ref_count(), 1);
        }
        assert_eq!(buffer.ref_count(), 0);
    }
}
