//! Page buffer cache.
//!
//! Maps [`VirtualPageId`]s to shared [`PageBuffer`]s. Concurrent loads of
//! the same page share one in-flight read. New reads are queued and issued
//! in batches by `flush_pages`, once the queue reaches
//! `read_batch_threshold`, or by the background manager tick. Dirty pages
//! are only written by an explicit `flush_pages` with `flush_writes`.

pub mod lru;
pub mod page_buffer;
pub mod replacer;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::storage::device::MultipleBufferDevice;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DeviceId, PageData, VirtualPageId};
use crate::storage::PAGE_SIZE;
use lru::LruReplacer;
use replacer::Replacer;

pub use page_buffer::{PageBuffer, PageBufferGuard, PageBufferState};

const CACHE_NAME: &str = "PageBufferCache";

/// Tuning knobs for [`PageBufferCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard limit on cached pages.
    pub max_cache_size: usize,
    /// Scavenging starts above this many cached pages...
    pub scavenge_on_threshold: usize,
    /// ...and stops once fewer than this many remain.
    pub scavenge_off_threshold: usize,
    /// Background manager tick.
    pub flush_interval: Duration,
    /// Data blocks kept allocated in the free pool at start-up.
    pub free_pool_min: usize,
    /// Upper bound on recycled data blocks.
    pub free_pool_max: usize,
    /// Queued reads that trigger an immediate read flush.
    pub read_batch_threshold: usize,
    /// Default time a caller waits for a page load.
    pub read_timeout: Duration,
    /// Run the background manager task.
    pub background_manager: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 2048,
            scavenge_on_threshold: 1800,
            scavenge_off_threshold: 1500,
            flush_interval: Duration::from_millis(500),
            free_pool_min: 50,
            free_pool_max: 100,
            read_batch_threshold: 32,
            read_timeout: Duration::from_secs(5),
            background_manager: true,
        }
    }
}

impl CacheConfig {
    pub fn with_max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    pub fn with_scavenge_thresholds(mut self, on: usize, off: usize) -> Self {
        self.scavenge_on_threshold = on;
        self.scavenge_off_threshold = off;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_free_pool(mut self, min: usize, max: usize) -> Self {
        self.free_pool_min = min;
        self.free_pool_max = max;
        self
    }

    pub fn with_read_batch_threshold(mut self, threshold: usize) -> Self {
        self.read_batch_threshold = threshold;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_background_manager(mut self, enabled: bool) -> Self {
        self.background_manager = enabled;
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.max_cache_size == 0 {
            return Err(StorageError::Other("max_cache_size must be positive".into()));
        }
        if self.scavenge_off_threshold > self.scavenge_on_threshold
            || self.scavenge_on_threshold > self.max_cache_size
        {
            return Err(StorageError::Other(format!(
                "scavenge thresholds must satisfy off ({}) <= on ({}) <= max ({})",
                self.scavenge_off_threshold, self.scavenge_on_threshold, self.max_cache_size
            )));
        }
        if self.free_pool_min > self.free_pool_max {
            return Err(StorageError::Other(format!(
                "free pool min {} exceeds max {}",
                self.free_pool_min, self.free_pool_max
            )));
        }
        Ok(())
    }
}

/// What a `flush_pages` call should drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushParams {
    pub flush_reads: bool,
    pub flush_writes: bool,
    pub for_checkpoint: bool,
}

impl FlushParams {
    pub fn reads() -> Self {
        Self {
            flush_reads: true,
            ..Self::default()
        }
    }

    pub fn writes() -> Self {
        Self {
            flush_writes: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            flush_reads: true,
            flush_writes: true,
            for_checkpoint: false,
        }
    }

    pub fn checkpoint() -> Self {
        Self {
            for_checkpoint: true,
            ..Self::all()
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads_issued: u64,
    pub loads_joined: u64,
    pub saves: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads_issued: AtomicU64,
    loads_joined: AtomicU64,
    saves: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads_issued: self.loads_issued.load(Ordering::Relaxed),
            loads_joined: self.loads_joined.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Recycled page-sized data blocks.
#[derive(Debug)]
struct FreeBlockPool {
    blocks: Mutex<Vec<Box<PageData>>>,
    max: usize,
}

impl FreeBlockPool {
    fn new(min: usize, max: usize) -> Self {
        let blocks = (0..min).map(|_| Box::new([0u8; PAGE_SIZE])).collect();
        Self {
            blocks: Mutex::new(blocks),
            max,
        }
    }

    fn take(&self) -> Box<PageData> {
        self.blocks
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new([0u8; PAGE_SIZE]))
    }

    fn give(&self, block: Box<PageData>) {
        let mut blocks = self.blocks.lock();
        if blocks.len() < self.max {
            blocks.push(block);
        }
    }

    fn len(&self) -> usize {
        self.blocks.lock().len()
    }
}

/// The operations the database device layer uses on a page cache.
#[async_trait]
pub trait CachingPageBufferDevice: Send + Sync {
    async fn add_device(
        &self,
        name: &str,
        path: &Path,
        device_id: DeviceId,
        create_page_count: u32,
    ) -> StorageResult<DeviceId>;

    async fn remove_device(&self, device_id: DeviceId) -> StorageResult<()>;

    /// A zeroed buffer for a page that does not exist on disk yet.
    async fn init_page(&self, page_id: VirtualPageId) -> StorageResult<PageBufferGuard>;

    /// Waits for the page, relying on some flush to issue the read.
    async fn load_page(&self, page_id: VirtualPageId) -> StorageResult<PageBufferGuard>;

    /// Loads the page, flushing queued reads itself.
    async fn fetch_page(&self, page_id: VirtualPageId) -> StorageResult<PageBufferGuard>;

    async fn flush_pages(&self, params: FlushParams) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

type LoadResult = Result<(), Arc<StorageError>>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

struct Slot {
    buffer: Arc<PageBuffer>,
    /// Present while the page's read is queued or in flight.
    load: Option<SharedLoad>,
}

struct PendingRead {
    buffer: Arc<PageBuffer>,
    done: oneshot::Sender<LoadResult>,
}

struct CacheInner {
    config: CacheConfig,
    provider: Arc<dyn MultipleBufferDevice>,
    entries: DashMap<VirtualPageId, Slot>,
    read_queue: Mutex<Vec<PendingRead>>,
    replacer: Arc<Mutex<Box<dyn Replacer>>>,
    free_pool: FreeBlockPool,
    flush_lock: tokio::sync::Mutex<()>,
    counters: CacheCounters,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

/// Deduplicating, batching page cache over a [`MultipleBufferDevice`].
#[derive(Clone)]
pub struct PageBufferCache {
    inner: Arc<CacheInner>,
}

impl PageBufferCache {
    /// Creates the cache. The background manager only starts when called
    /// inside a tokio runtime.
    pub fn new(
        provider: Arc<dyn MultipleBufferDevice>,
        config: CacheConfig,
    ) -> StorageResult<Self> {
        config.validate()?;
        let replacer: Box<dyn Replacer> = Box::new(LruReplacer::new(config.max_cache_size));

        let cache = Self {
            inner: Arc::new(CacheInner {
                free_pool: FreeBlockPool::new(config.free_pool_min, config.free_pool_max),
                provider,
                entries: DashMap::new(),
                read_queue: Mutex::new(Vec::new()),
                replacer: Arc::new(Mutex::new(replacer)),
                flush_lock: tokio::sync::Mutex::new(()),
                counters: CacheCounters::default(),
                closed: AtomicBool::new(false),
                shutdown: Arc::new(Notify::new()),
                manager: Mutex::new(None),
                config,
            }),
        };

        if cache.inner.config.background_manager {
            if tokio::runtime::Handle::try_current().is_ok() {
                cache.start_manager();
            } else {
                warn!("No tokio runtime; page cache background manager not started");
            }
        }
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }

    /// Number of cached pages, including pages still loading.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, page_id: VirtualPageId) -> bool {
        self.inner.entries.contains_key(&page_id)
    }

    pub fn pending_reads(&self) -> usize {
        self.inner.read_queue.lock().len()
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.free_pool.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            Err(StorageError::ObjectDisposed(CACHE_NAME))
        } else {
            Ok(())
        }
    }

    fn guard(&self, buffer: Arc<PageBuffer>) -> PageBufferGuard {
        PageBufferGuard::new(buffer, Some(Arc::clone(&self.inner.replacer)))
    }

    fn join(&self, slot: &Slot) -> (PageBufferGuard, Option<SharedLoad>) {
        let guard = self.guard(Arc::clone(&slot.buffer));
        match &slot.load {
            Some(load) => {
                CacheCounters::bump(&self.inner.counters.loads_joined);
                (guard, Some(load.clone()))
            }
            None => {
                CacheCounters::bump(&self.inner.counters.hits);
                (guard, None)
            }
        }
    }

    /// Makes room for one more page, scavenging if the cache is full.
    fn ensure_capacity(&self, page_id: VirtualPageId) -> StorageResult<()> {
        let max = self.inner.config.max_cache_size;
        if self.inner.entries.len() < max {
            return Ok(());
        }
        self.scavenge(self.inner.config.scavenge_off_threshold);
        if self.inner.entries.len() >= max {
            warn!("Cache full ({} pages) loading {}", max, page_id);
            return Err(StorageError::CacheFull(page_id));
        }
        Ok(())
    }

    /// Finds or creates the slot for `page_id`, queueing a read for a new
    /// one. Returns the caller's guard, the load to wait on (if any) and the
    /// read queue length after queueing.
    fn request_load(
        &self,
        page_id: VirtualPageId,
    ) -> StorageResult<(PageBufferGuard, Option<SharedLoad>, usize)> {
        self.check_open()?;

        if let Some(slot) = self.inner.entries.get(&page_id) {
            let (guard, load) = self.join(&slot);
            return Ok((guard, load, 0));
        }

        self.ensure_capacity(page_id)?;
        let block = self.inner.free_pool.take();

        match self.inner.entries.entry(page_id) {
            Entry::Occupied(slot) => {
                let (guard, load) = self.join(slot.get());
                drop(slot);
                self.inner.free_pool.give(block);
                Ok((guard, load, 0))
            }
            Entry::Vacant(vacant) => {
                let buffer = Arc::new(PageBuffer::new(page_id, block));
                buffer.request_load()?;

                let (done, receiver) = oneshot::channel::<LoadResult>();
                let load: SharedLoad = receiver
                    .map(|result| {
                        result.unwrap_or_else(|_| {
                            Err(Arc::new(StorageError::ObjectDisposed(CACHE_NAME)))
                        })
                    })
                    .boxed()
                    .shared();

                let guard = self.guard(Arc::clone(&buffer));
                vacant.insert(Slot {
                    buffer: Arc::clone(&buffer),
                    load: Some(load.clone()),
                });
                CacheCounters::bump(&self.inner.counters.misses);

                let queued = {
                    let mut queue = self.inner.read_queue.lock();
                    queue.push(PendingRead { buffer, done });
                    queue.len()
                };
                trace!("{} queued for load ({} pending)", page_id, queued);
                Ok((guard, Some(load), queued))
            }
        }
    }

    async fn wait_for_load(
        &self,
        page_id: VirtualPageId,
        guard: PageBufferGuard,
        load: Option<SharedLoad>,
        timeout: Duration,
    ) -> StorageResult<PageBufferGuard> {
        let Some(load) = load else {
            return Ok(guard);
        };

        match tokio::time::timeout(timeout, load).await {
            Ok(Ok(())) => Ok(guard),
            Ok(Err(err)) => Err(StorageError::Shared(err)),
            Err(_) => {
                warn!("Load of {} timed out after {:?}", page_id, timeout);
                Err(StorageError::ReadTimeout { page_id, timeout })
            }
        }
    }

    /// Like `load_page` with a per-call timeout. On timeout the read keeps
    /// running and populates the cache for later callers.
    pub async fn load_page_with_timeout(
        &self,
        page_id: VirtualPageId,
        timeout: Duration,
    ) -> StorageResult<PageBufferGuard> {
        let (guard, load, queued) = self.request_load(page_id)?;
        if queued >= self.inner.config.read_batch_threshold {
            self.spawn_read_flush();
        }
        self.wait_for_load(page_id, guard, load, timeout).await
    }

    fn spawn_read_flush(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            if let Err(err) = cache.flush_internal(FlushParams::reads()).await {
                warn!("Batched read flush failed: {}", err);
            }
        });
    }

    async fn issue_read(&self, read: PendingRead) -> DeviceId {
        let page_id = read.buffer.page_id();
        let result = self.read_into(&read.buffer).await;

        match &result {
            Ok(()) => {
                if let Some(mut slot) = self.inner.entries.get_mut(&page_id) {
                    if Arc::ptr_eq(&slot.buffer, &read.buffer) {
                        slot.load = None;
                    }
                }
            }
            Err(err) => {
                warn!("Load of {} failed: {}", page_id, err);
                read.buffer.fail_load();
                self.inner
                    .entries
                    .remove_if(&page_id, |_, slot| Arc::ptr_eq(&slot.buffer, &read.buffer));
                self.inner.replacer.lock().remove(page_id);
            }
        }

        // Waiters that timed out have dropped their receivers.
        let _ = read.done.send(result.map_err(Arc::new));
        page_id.device_id()
    }

    async fn read_into(&self, buffer: &PageBuffer) -> StorageResult<()> {
        buffer.begin_load()?;
        let mut block = self.inner.free_pool.take();
        if let Err(err) = self
            .inner
            .provider
            .load_buffer(buffer.page_id(), &mut block)
            .await
        {
            self.inner.free_pool.give(block);
            return Err(err);
        }

        let previous = buffer.complete_load(block)?;
        self.inner.free_pool.give(previous);
        CacheCounters::bump(&self.inner.counters.loads_issued);
        Ok(())
    }

    async fn save(&self, buffer: &PageBuffer) -> StorageResult<()> {
        let snapshot = buffer.begin_save()?;
        let result = self
            .inner
            .provider
            .save_buffer(buffer.page_id(), &snapshot)
            .await;
        self.inner.free_pool.give(snapshot);

        match result {
            Ok(()) => {
                buffer.complete_save()?;
                CacheCounters::bump(&self.inner.counters.saves);
                Ok(())
            }
            Err(err) => {
                warn!("Save of {} failed: {}", buffer.page_id(), err);
                buffer.fail_save();
                Err(err)
            }
        }
    }

    /// Dirty buffers in page order, optionally limited to one device.
    fn dirty_buffers(&self, device_id: Option<DeviceId>) -> Vec<Arc<PageBuffer>> {
        let mut dirty: Vec<Arc<PageBuffer>> = self
            .inner
            .entries
            .iter()
            .filter(|entry| device_id.map_or(true, |id| entry.key().device_id() == id))
            .filter(|entry| entry.value().buffer.is_dirty())
            .map(|entry| Arc::clone(&entry.value().buffer))
            .collect();
        dirty.sort_by_key(|buffer| buffer.page_id());
        dirty
    }

    async fn flush_internal(&self, params: FlushParams) -> StorageResult<()> {
        let _flush = self.inner.flush_lock.lock().await;
        let mut touched = BTreeSet::new();
        let mut first_error = None;

        if params.flush_reads {
            let pending = std::mem::take(&mut *self.inner.read_queue.lock());
            if !pending.is_empty() {
                debug!("Issuing {} queued read(s)", pending.len());
            }
            let devices = join_all(pending.into_iter().map(|read| self.issue_read(read))).await;
            touched.extend(devices);
        }

        if params.flush_writes {
            let dirty = self.dirty_buffers(None);
            if !dirty.is_empty() {
                debug!(
                    "Writing {} dirty page(s){}",
                    dirty.len(),
                    if params.for_checkpoint { " for checkpoint" } else { "" }
                );
            }
            for buffer in dirty {
                touched.insert(buffer.page_id().device_id());
                if let Err(err) = self.save(&buffer).await {
                    first_error.get_or_insert(err);
                }
            }
        }

        for device_id in touched {
            if let Err(err) = self
                .inner
                .provider
                .flush_buffers(params.flush_reads, params.flush_writes, device_id)
                .await
            {
                warn!("Flushing device {} failed: {}", device_id, err);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Frees clean, unreferenced pages in LRU order until fewer than
    /// `target` remain. Returns the number of pages freed.
    pub fn scavenge(&self, target: usize) -> usize {
        let mut freed = 0;
        let mut skipped = Vec::new();

        while self.inner.entries.len() >= target {
            let candidate = self.inner.replacer.lock().evict();
            let Some(page_id) = candidate else {
                break;
            };

            let removed = self.inner.entries.remove_if(&page_id, |_, slot| {
                slot.load.is_none() && slot.buffer.can_free()
            });
            match removed {
                Some((_, slot)) => {
                    self.recycle(slot.buffer);
                    CacheCounters::bump(&self.inner.counters.evictions);
                    freed += 1;
                }
                None => {
                    if let Some(slot) = self.inner.entries.get(&page_id) {
                        skipped.push(Arc::clone(&slot.buffer));
                    }
                }
            }
        }

        // Dirty pages stay evictable for the next pass.
        if !skipped.is_empty() {
            let mut replacer = self.inner.replacer.lock();
            for buffer in skipped {
                if buffer.ref_count() == 0 {
                    replacer.unpin(buffer.page_id());
                }
            }
        }

        if freed > 0 {
            debug!(
                "Scavenged {} page(s), {} cached",
                freed,
                self.inner.entries.len()
            );
        }
        freed
    }

    fn recycle(&self, buffer: Arc<PageBuffer>) {
        if let Err(err) = buffer.set_free() {
            trace!("Not recycling {}: {}", buffer.page_id(), err);
            return;
        }
        if let Ok(buffer) = Arc::try_unwrap(buffer) {
            self.inner.free_pool.give(buffer.into_block());
        }
    }

    fn start_manager(&self) {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let shutdown = Arc::clone(&self.inner.shutdown);
        let interval = self.inner.config.flush_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = PageBufferCache { inner };
                if cache.is_closed() {
                    break;
                }
                cache.manage().await;
            }
            trace!("Page cache manager stopped");
        });
        *self.inner.manager.lock() = Some(handle);
    }

    /// One background tick: issue queued reads, then scavenge if needed.
    async fn manage(&self) {
        if self.pending_reads() > 0 {
            if let Err(err) = self.flush_internal(FlushParams::reads()).await {
                warn!("Background read flush failed: {}", err);
            }
        }
        if self.inner.entries.len() > self.inner.config.scavenge_on_threshold {
            self.scavenge(self.inner.config.scavenge_off_threshold);
        }
    }

    fn fail_queued_reads(
        &self,
        matches: impl Fn(&PendingRead) -> bool,
        error: impl Fn() -> StorageError,
    ) {
        let failed = {
            let mut queue = self.inner.read_queue.lock();
            let (failed, kept): (Vec<PendingRead>, Vec<PendingRead>) =
                std::mem::take(&mut *queue).into_iter().partition(|r| matches(r));
            *queue = kept;
            failed
        };
        for read in failed {
            read.buffer.fail_load();
            let _ = read.done.send(Err(Arc::new(error())));
        }
    }
}

#[async_trait]
impl CachingPageBufferDevice for PageBufferCache {
    async fn add_device(
        &self,
        name: &str,
        path: &Path,
        device_id: DeviceId,
        create_page_count: u32,
    ) -> StorageResult<DeviceId> {
        self.check_open()?;
        self.inner
            .provider
            .add_device(name, path, device_id, create_page_count)
            .await
    }

    async fn remove_device(&self, device_id: DeviceId) -> StorageResult<()> {
        self.check_open()?;

        let pinned = self
            .inner
            .entries
            .iter()
            .filter(|entry| {
                entry.key().device_id() == device_id && entry.value().buffer.ref_count() > 0
            })
            .count();
        if pinned > 0 {
            return Err(StorageError::DevicePinned { device_id, pinned });
        }

        {
            let _flush = self.inner.flush_lock.lock().await;
            for buffer in self.dirty_buffers(Some(device_id)) {
                self.save(&buffer).await?;
            }
        }

        let page_ids: Vec<VirtualPageId> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().device_id() == device_id)
            .map(|entry| *entry.key())
            .collect();
        for page_id in page_ids {
            if self
                .inner
                .entries
                .remove_if(&page_id, |_, slot| slot.buffer.ref_count() == 0)
                .is_some()
            {
                self.inner.replacer.lock().remove(page_id);
            }
        }
        self.fail_queued_reads(
            |read| read.buffer.page_id().device_id() == device_id,
            || StorageError::DeviceNotFound(device_id),
        );

        self.inner.provider.remove_device(device_id).await?;
        info!("Removed device {} from page cache", device_id);
        Ok(())
    }

    async fn init_page(&self, page_id: VirtualPageId) -> StorageResult<PageBufferGuard> {
        self.check_open()?;

        let cached = self.inner.entries.get(&page_id).map(|slot| self.join(&slot));
        if let Some((guard, load)) = cached {
            return self
                .wait_for_load(page_id, guard, load, self.inner.config.read_timeout)
                .await;
        }

        self.ensure_capacity(page_id)?;
        let block = self.inner.free_pool.take();

        let (guard, load) = match self.inner.entries.entry(page_id) {
            Entry::Occupied(slot) => {
                let joined = self.join(slot.get());
                drop(slot);
                self.inner.free_pool.give(block);
                joined
            }
            Entry::Vacant(vacant) => {
                let buffer = Arc::new(PageBuffer::new(page_id, block));
                buffer.init()?;
                let guard = self.guard(Arc::clone(&buffer));
                vacant.insert(Slot { buffer, load: None });
                CacheCounters::bump(&self.inner.counters.misses);
                trace!("{} initialised in cache", page_id);
                (guard, None)
            }
        };
        self.wait_for_load(page_id, guard, load, self.inner.config.read_timeout)
            .await
    }

    async fn load_page(&self, page_id: VirtualPageId) -> StorageResult<PageBufferGuard> {
        self.load_page_with_timeout(page_id, self.inner.config.read_timeout)
            .await
    }

    async fn fetch_page(&self, page_id: VirtualPageId) -> StorageResult<PageBufferGuard> {
        let (guard, load, _) = self.request_load(page_id)?;
        if load.is_some() {
            self.flush_internal(FlushParams::reads()).await?;
        }
        self.wait_for_load(page_id, guard, load, self.inner.config.read_timeout)
            .await
    }

    async fn flush_pages(&self, params: FlushParams) -> StorageResult<()> {
        self.check_open()?;
        self.flush_internal(params).await
    }

    async fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::ObjectDisposed(CACHE_NAME));
        }

        let flushed = self.flush_internal(FlushParams::all()).await;

        self.inner.shutdown.notify_one();
        let manager = self.inner.manager.lock().take();
        if let Some(handle) = manager {
            handle.abort();
            let _ = handle.await;
        }

        self.fail_queued_reads(|_| true, || StorageError::ObjectDisposed(CACHE_NAME));
        self.inner.entries.clear();

        let closed = self.inner.provider.close().await;
        info!("Page buffer cache closed");
        flushed.and(closed)
    }
}
