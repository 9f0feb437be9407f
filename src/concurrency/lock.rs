//! Lock management for index and data pages.
//!
//! Index pages take different locks depending on their position in the
//! tree: a root lock per index, an internal lock per intermediate page and
//! a data lock per leaf page. [`DatabaseLockManager`] is the contract the
//! index page calls; [`LockManager`] is the in-process implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{trace, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{IndexId, LogicalPageId, ObjectId};
use crate::transaction::id::TransactionId;

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for read operations.
    Shared,
    /// Read now, may upgrade to exclusive later.
    Update,
    /// Exclusive lock for write operations.
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!(
            (self, other),
            (LockMode::Shared, LockMode::Shared)
                | (LockMode::Shared, LockMode::Update)
                | (LockMode::Update, LockMode::Shared)
        )
    }

    /// Whether index structure locks taken on behalf of this mode are exclusive.
    pub fn is_writable(&self) -> bool {
        matches!(self, LockMode::Exclusive)
    }

    fn from_writable(writable: bool) -> Self {
        if writable {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

/// Identifier for a lockable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Lock on the root of an index.
    RootIndex(ObjectId, IndexId),
    /// Lock on an intermediate index page.
    InternalIndex(ObjectId, IndexId, LogicalPageId),
    /// Lock on a data (leaf) page.
    Data(ObjectId, LogicalPageId),
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockId::RootIndex(object, index) => write!(f, "root lock {}/{}", object, index),
            LockId::InternalIndex(object, index, page) => {
                write!(f, "internal lock {}/{}/{}", object, index, page)
            }
            LockId::Data(object, page) => write!(f, "data lock {}/{}", object, page),
        }
    }
}

/// Acquire/release contract used by index pages.
///
/// Every `lock_*` call that succeeds must be paired with the matching
/// `unlock_*` call carrying the same mode.
#[async_trait]
pub trait DatabaseLockManager: Send + Sync {
    async fn lock_root_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        writable: bool,
        timeout: Duration,
    ) -> StorageResult<()>;

    async fn unlock_root_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        writable: bool,
    ) -> StorageResult<()>;

    async fn lock_internal_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        logical_id: LogicalPageId,
        writable: bool,
        timeout: Duration,
    ) -> StorageResult<()>;

    async fn unlock_internal_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        logical_id: LogicalPageId,
        writable: bool,
    ) -> StorageResult<()>;

    async fn lock_data(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        logical_id: LogicalPageId,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()>;

    async fn unlock_data(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        logical_id: LogicalPageId,
        mode: LockMode,
    ) -> StorageResult<()>;
}

/// Request for a lock from a transaction.
#[derive(Debug, Clone)]
pub struct LockRequest {
    id: u64,
    pub owner: TransactionId,
    pub mode: LockMode,
    pub granted: bool,
}

/// Information about a lock.
#[derive(Debug)]
struct LockInfo {
    /// Queue of lock requests (both granted and waiting).
    requests: VecDeque<LockRequest>,
    /// Wakes waiters whenever a request is granted.
    notify: Arc<Notify>,
}

impl LockInfo {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Requests held by other owners never block their own owner.
    fn conflicts(&self, owner: TransactionId, mode: LockMode) -> bool {
        self.requests
            .iter()
            .filter(|r| r.granted && r.owner != owner)
            .any(|r| !r.mode.is_compatible_with(&mode))
    }

    fn has_waiters(&self) -> bool {
        self.requests.iter().any(|r| !r.granted)
    }

    fn holds_any(&self, owner: TransactionId) -> bool {
        self.requests.iter().any(|r| r.owner == owner && r.granted)
    }

    fn is_request_granted(&self, id: u64) -> bool {
        self.requests.iter().any(|r| r.id == id && r.granted)
    }

    /// Grants waiting requests in FIFO order up to the first conflict.
    fn grant_compatible_requests(&mut self) {
        let mut granted_any = false;

        for i in 0..self.requests.len() {
            if self.requests[i].granted {
                continue;
            }
            let (owner, mode) = (self.requests[i].owner, self.requests[i].mode);
            if self.conflicts(owner, mode) {
                break;
            }
            self.requests[i].granted = true;
            granted_any = true;
        }

        if granted_any {
            self.notify.notify_waiters();
        }
    }

    /// Removes one request of `owner` in `mode`, preferring a granted one.
    fn remove_request(&mut self, owner: TransactionId, mode: LockMode) -> bool {
        let position = self
            .requests
            .iter()
            .position(|r| r.owner == owner && r.mode == mode && r.granted)
            .or_else(|| {
                self.requests
                    .iter()
                    .position(|r| r.owner == owner && r.mode == mode)
            });
        match position {
            Some(i) => {
                self.requests.remove(i);
                true
            }
            None => false,
        }
    }
}

/// In-process lock manager.
///
/// Requests are queued per resource and granted in arrival order, except
/// that an owner already holding the resource does not queue behind other
/// waiters. A waiter gives up with `LockTimeout` once its timeout elapses;
/// the caller decides whether to retry, escalate or abort.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<LockId, LockInfo>>,
    next_request: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a lock for a transaction.
    pub async fn acquire_lock(
        &self,
        owner: TransactionId,
        lock_id: LockId,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);

        let notify = {
            let mut locks = self.locks.lock();
            let info = locks.entry(lock_id.clone()).or_insert_with(LockInfo::new);
            let granted =
                (info.holds_any(owner) || !info.has_waiters()) && !info.conflicts(owner, mode);
            info.requests.push_back(LockRequest {
                id,
                owner,
                mode,
                granted,
            });
            if granted {
                trace!("{} granted {} ({:?})", owner, lock_id, mode);
                return Ok(());
            }
            Arc::clone(&info.notify)
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_granted(&lock_id, id) {
                trace!("{} granted {} ({:?}) after wait", owner, lock_id, mode);
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut locks = self.locks.lock();
                if let Some(info) = locks.get_mut(&lock_id) {
                    // Granted between the wakeup and the deadline.
                    if info.is_request_granted(id) {
                        return Ok(());
                    }
                    info.requests.retain(|r| r.id != id);
                    if info.requests.is_empty() {
                        locks.remove(&lock_id);
                    } else {
                        info.grant_compatible_requests();
                    }
                }
                warn!("{} timed out waiting for {} ({:?})", owner, lock_id, mode);
                return Err(StorageError::LockTimeout {
                    resource: lock_id.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Releases one lock held by a transaction in the given mode.
    pub fn release_lock(
        &self,
        owner: TransactionId,
        lock_id: &LockId,
        mode: LockMode,
    ) -> StorageResult<()> {
        let mut locks = self.locks.lock();
        let info = locks
            .get_mut(lock_id)
            .ok_or_else(|| StorageError::Other(format!("{} is not held", lock_id)))?;

        if !info.remove_request(owner, mode) {
            return Err(StorageError::Other(format!(
                "{} does not hold {} ({:?})",
                owner, lock_id, mode
            )));
        }

        if info.requests.is_empty() {
            locks.remove(lock_id);
        } else {
            info.grant_compatible_requests();
        }
        trace!("{} released {} ({:?})", owner, lock_id, mode);
        Ok(())
    }

    /// Releases every lock held or awaited by a transaction.
    pub fn release_all_locks(&self, owner: TransactionId) {
        let mut locks = self.locks.lock();
        locks.retain(|_, info| {
            info.requests.retain(|r| r.owner != owner);
            if info.requests.is_empty() {
                false
            } else {
                info.grant_compatible_requests();
                true
            }
        });
    }

    /// Gets all locks held by a transaction.
    pub fn get_transaction_locks(&self, owner: TransactionId) -> Vec<LockId> {
        let locks = self.locks.lock();
        locks
            .iter()
            .filter(|(_, info)| info.requests.iter().any(|r| r.owner == owner && r.granted))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Checks if a transaction holds a specific lock.
    pub fn has_lock(&self, owner: TransactionId, lock_id: &LockId, mode: LockMode) -> bool {
        let locks = self.locks.lock();
        locks.get(lock_id).map_or(false, |info| {
            info.requests.iter().any(|r| {
                r.owner == owner
                    && r.granted
                    && (r.mode == mode || r.mode == LockMode::Exclusive)
            })
        })
    }

    fn is_granted(&self, lock_id: &LockId, id: u64) -> bool {
        let locks = self.locks.lock();
        locks
            .get(lock_id)
            .map_or(false, |info| info.is_request_granted(id))
    }
}

#[async_trait]
impl DatabaseLockManager for LockManager {
    async fn lock_root_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        writable: bool,
        timeout: Duration,
    ) -> StorageResult<()> {
        self.acquire_lock(
            owner,
            LockId::RootIndex(object_id, index_id),
            LockMode::from_writable(writable),
            timeout,
        )
        .await
    }

    async fn unlock_root_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        writable: bool,
    ) -> StorageResult<()> {
        self.release_lock(
            owner,
            &LockId::RootIndex(object_id, index_id),
            LockMode::from_writable(writable),
        )
    }

    async fn lock_internal_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        logical_id: LogicalPageId,
        writable: bool,
        timeout: Duration,
    ) -> StorageResult<()> {
        self.acquire_lock(
            owner,
            LockId::InternalIndex(object_id, index_id, logical_id),
            LockMode::from_writable(writable),
            timeout,
        )
        .await
    }

    async fn unlock_internal_index(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        index_id: IndexId,
        logical_id: LogicalPageId,
        writable: bool,
    ) -> StorageResult<()> {
        self.release_lock(
            owner,
            &LockId::InternalIndex(object_id, index_id, logical_id),
            LockMode::from_writable(writable),
        )
    }

    async fn lock_data(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        logical_id: LogicalPageId,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()> {
        self.acquire_lock(owner, LockId::Data(object_id, logical_id), mode, timeout)
            .await
    }

    async fn unlock_data(
        &self,
        owner: TransactionId,
        object_id: ObjectId,
        logical_id: LogicalPageId,
        mode: LockMode,
    ) -> StorageResult<()> {
        self.release_lock(owner, &LockId::Data(object_id, logical_id), mode)
    }
}
