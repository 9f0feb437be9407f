//! Log entry types and their on-disk format.
//!
//! Every entry starts with a one-byte type tag followed by `log_id` and
//! `last_log` (both `u32`), then the variant's own fields. All integers are
//! little-endian and page images are exactly `PAGE_SIZE` bytes.

use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;
use parking_lot::Mutex;

use crate::storage::buffer::CachingPageBufferDevice;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageData, VirtualPageId};
use crate::storage::PAGE_SIZE;
use crate::transaction::id::TransactionId;

/// Size of the tag byte plus `log_id` and `last_log`.
pub const LOG_ENTRY_HEADER_SIZE: usize = 9;

/// Size of one active transaction record inside a checkpoint entry.
pub const ACTIVE_TRANSACTION_SIZE: usize = 14;

/// Log entry type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogEntryKind {
    NoOp = 0,
    BeginCheckpoint = 1,
    EndCheckpoint = 2,
    BeginXact = 3,
    CommitXact = 4,
    RollbackXact = 5,
    CreatePage = 6,
    ModifyPage = 7,
    DeletePage = 8,
}

impl TryFrom<u8> for LogEntryKind {
    type Error = StorageError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => LogEntryKind::NoOp,
            1 => LogEntryKind::BeginCheckpoint,
            2 => LogEntryKind::EndCheckpoint,
            3 => LogEntryKind::BeginXact,
            4 => LogEntryKind::CommitXact,
            5 => LogEntryKind::RollbackXact,
            6 => LogEntryKind::CreatePage,
            7 => LogEntryKind::ModifyPage,
            8 => LogEntryKind::DeletePage,
            other => return Err(StorageError::InvalidLogEntryType(other)),
        })
    }
}

/// A transaction that was open when a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTransaction {
    /// Transaction ID.
    pub transaction_id: TransactionId,
    /// Log file holding the transaction's first entry.
    pub file_id: u16,
    /// Byte offset of the first entry within that file.
    pub file_offset: u32,
    /// Log ID of the transaction's first entry.
    pub first_log_id: u32,
}

impl ActiveTransaction {
    fn write_to<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        writer.write_u16::<LittleEndian>(self.file_id)?;
        writer.write_u32::<LittleEndian>(self.file_offset)?;
        writer.write_u32::<LittleEndian>(self.first_log_id)?;
        writer.write_u32::<LittleEndian>(self.transaction_id.value())?;
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> StorageResult<Self> {
        let file_id = reader.read_u16::<LittleEndian>()?;
        let file_offset = reader.read_u32::<LittleEndian>()?;
        let first_log_id = reader.read_u32::<LittleEndian>()?;
        let transaction_id = TransactionId::new(reader.read_u32::<LittleEndian>()?);
        Ok(Self {
            transaction_id,
            file_id,
            file_offset,
            first_log_id,
        })
    }
}

/// Identifies the page version a page entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageChange {
    /// Transaction that changed the page.
    pub transaction_id: TransactionId,
    /// Page that was changed.
    pub virtual_page_id: VirtualPageId,
    /// Page timestamp after the change.
    pub timestamp: i64,
}

/// Variant-specific part of a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntryBody {
    NoOp,
    BeginCheckpoint(Vec<ActiveTransaction>),
    EndCheckpoint(Vec<ActiveTransaction>),
    BeginXact(TransactionId),
    CommitXact(TransactionId),
    RollbackXact(TransactionId),
    CreatePage {
        change: PageChange,
        after: Box<PageData>,
    },
    ModifyPage {
        change: PageChange,
        before: Box<PageData>,
        after: Box<PageData>,
    },
    DeletePage {
        change: PageChange,
        before: Box<PageData>,
    },
}

/// One record in the transaction log.
#[derive(Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position of this entry in the log, assigned on append.
    pub log_id: u32,
    /// Previous entry of the same transaction (0 for none).
    pub last_log: u32,
    pub body: LogEntryBody,
}

impl LogEntry {
    pub fn new(body: LogEntryBody) -> Self {
        Self {
            log_id: 0,
            last_log: 0,
            body,
        }
    }

    pub fn no_op() -> Self {
        Self::new(LogEntryBody::NoOp)
    }

    pub fn begin_xact(transaction_id: TransactionId) -> Self {
        Self::new(LogEntryBody::BeginXact(transaction_id))
    }

    pub fn commit_xact(transaction_id: TransactionId) -> Self {
        Self::new(LogEntryBody::CommitXact(transaction_id))
    }

    pub fn rollback_xact(transaction_id: TransactionId) -> Self {
        Self::new(LogEntryBody::RollbackXact(transaction_id))
    }

    pub fn create_page(change: PageChange, after: Box<PageData>) -> Self {
        Self::new(LogEntryBody::CreatePage { change, after })
    }

    pub fn modify_page(change: PageChange, before: Box<PageData>, after: Box<PageData>) -> Self {
        Self::new(LogEntryBody::ModifyPage {
            change,
            before,
            after,
        })
    }

    pub fn delete_page(change: PageChange, before: Box<PageData>) -> Self {
        Self::new(LogEntryBody::DeletePage { change, before })
    }

    pub fn kind(&self) -> LogEntryKind {
        match &self.body {
            LogEntryBody::NoOp => LogEntryKind::NoOp,
            LogEntryBody::BeginCheckpoint(_) => LogEntryKind::BeginCheckpoint,
            LogEntryBody::EndCheckpoint(_) => LogEntryKind::EndCheckpoint,
            LogEntryBody::BeginXact(_) => LogEntryKind::BeginXact,
            LogEntryBody::CommitXact(_) => LogEntryKind::CommitXact,
            LogEntryBody::RollbackXact(_) => LogEntryKind::RollbackXact,
            LogEntryBody::CreatePage { .. } => LogEntryKind::CreatePage,
            LogEntryBody::ModifyPage { .. } => LogEntryKind::ModifyPage,
            LogEntryBody::DeletePage { .. } => LogEntryKind::DeletePage,
        }
    }

    /// The owning transaction, for transaction and page entries.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match &self.body {
            LogEntryBody::BeginXact(id)
            | LogEntryBody::CommitXact(id)
            | LogEntryBody::RollbackXact(id) => Some(*id),
            LogEntryBody::CreatePage { change, .. }
            | LogEntryBody::ModifyPage { change, .. }
            | LogEntryBody::DeletePage { change, .. } => Some(change.transaction_id),
            _ => None,
        }
    }

    pub fn page_change(&self) -> Option<&PageChange> {
        match &self.body {
            LogEntryBody::CreatePage { change, .. }
            | LogEntryBody::ModifyPage { change, .. }
            | LogEntryBody::DeletePage { change, .. } => Some(change),
            _ => None,
        }
    }

    pub fn before_image(&self) -> Option<&PageData> {
        match &self.body {
            LogEntryBody::ModifyPage { before, .. } | LogEntryBody::DeletePage { before, .. } => {
                Some(&**before)
            }
            _ => None,
        }
    }

    pub fn after_image(&self) -> Option<&PageData> {
        match &self.body {
            LogEntryBody::CreatePage { after, .. } | LogEntryBody::ModifyPage { after, .. } => {
                Some(&**after)
            }
            _ => None,
        }
    }

    pub fn active_transactions(&self) -> &[ActiveTransaction] {
        match &self.body {
            LogEntryBody::BeginCheckpoint(active) | LogEntryBody::EndCheckpoint(active) => active,
            _ => &[],
        }
    }

    /// Active transaction with the lowest first log id; recovery must scan
    /// back at least this far.
    pub fn first_protected_transaction(&self) -> Option<&ActiveTransaction> {
        self.active_transactions()
            .iter()
            .min_by_key(|active| active.first_log_id)
    }

    /// Encoded size in bytes.
    pub fn raw_size(&self) -> usize {
        const TXN: usize = 4;
        const PAGE: usize = TXN + 8 + 8;

        LOG_ENTRY_HEADER_SIZE
            + match &self.body {
                LogEntryBody::NoOp => 0,
                LogEntryBody::BeginCheckpoint(active) | LogEntryBody::EndCheckpoint(active) => {
                    2 + active.len() * ACTIVE_TRANSACTION_SIZE
                }
                LogEntryBody::BeginXact(_)
                | LogEntryBody::CommitXact(_)
                | LogEntryBody::RollbackXact(_) => TXN,
                LogEntryBody::CreatePage { .. } | LogEntryBody::DeletePage { .. } => {
                    PAGE + PAGE_SIZE
                }
                LogEntryBody::ModifyPage { .. } => PAGE + 2 * PAGE_SIZE,
            }
    }

    pub fn write_entry<W: Write>(&self, writer: &mut W) -> StorageResult<()> {
        writer.write_u8(self.kind() as u8)?;
        writer.write_u32::<LittleEndian>(self.log_id)?;
        writer.write_u32::<LittleEndian>(self.last_log)?;

        match &self.body {
            LogEntryBody::NoOp => {}
            LogEntryBody::BeginCheckpoint(active) | LogEntryBody::EndCheckpoint(active) => {
                let count = u16::try_from(active.len()).map_err(|_| {
                    StorageError::Other(format!(
                        "checkpoint cannot record {} active transactions",
                        active.len()
                    ))
                })?;
                writer.write_u16::<LittleEndian>(count)?;
                for transaction in active {
                    transaction.write_to(writer)?;
                }
            }
            LogEntryBody::BeginXact(id)
            | LogEntryBody::CommitXact(id)
            | LogEntryBody::RollbackXact(id) => {
                writer.write_u32::<LittleEndian>(id.value())?;
            }
            LogEntryBody::CreatePage { change, after } => {
                write_page_change(writer, change)?;
                writer.write_all(&after[..])?;
            }
            LogEntryBody::ModifyPage {
                change,
                before,
                after,
            } => {
                write_page_change(writer, change)?;
                writer.write_all(&before[..])?;
                writer.write_all(&after[..])?;
            }
            LogEntryBody::DeletePage { change, before } => {
                write_page_change(writer, change)?;
                writer.write_all(&before[..])?;
            }
        }
        Ok(())
    }

    pub fn read_entry<R: Read>(reader: &mut R) -> StorageResult<Self> {
        let kind = LogEntryKind::try_from(reader.read_u8()?)?;
        let log_id = reader.read_u32::<LittleEndian>()?;
        let last_log = reader.read_u32::<LittleEndian>()?;

        let body = match kind {
            LogEntryKind::NoOp => LogEntryBody::NoOp,
            LogEntryKind::BeginCheckpoint => LogEntryBody::BeginCheckpoint(read_active(reader)?),
            LogEntryKind::EndCheckpoint => LogEntryBody::EndCheckpoint(read_active(reader)?),
            LogEntryKind::BeginXact => LogEntryBody::BeginXact(read_transaction_id(reader)?),
            LogEntryKind::CommitXact => LogEntryBody::CommitXact(read_transaction_id(reader)?),
            LogEntryKind::RollbackXact => LogEntryBody::RollbackXact(read_transaction_id(reader)?),
            LogEntryKind::CreatePage => LogEntryBody::CreatePage {
                change: read_page_change(reader)?,
                after: read_image(reader)?,
            },
            LogEntryKind::ModifyPage => LogEntryBody::ModifyPage {
                change: read_page_change(reader)?,
                before: read_image(reader)?,
                after: read_image(reader)?,
            },
            LogEntryKind::DeletePage => LogEntryBody::DeletePage {
                change: read_page_change(reader)?,
                before: read_image(reader)?,
            },
        };

        Ok(Self {
            log_id,
            last_log,
            body,
        })
    }

    /// Re-applies this entry's effect.
    pub async fn roll_forward(&self, ctx: &RecoveryContext) -> StorageResult<()> {
        match &self.body {
            LogEntryBody::NoOp
            | LogEntryBody::BeginCheckpoint(_)
            | LogEntryBody::EndCheckpoint(_) => Ok(()),
            LogEntryBody::BeginXact(id) => {
                ctx.begin_transaction(*id);
                Ok(())
            }
            LogEntryBody::CommitXact(id) | LogEntryBody::RollbackXact(id) => {
                ctx.end_transaction(*id);
                Ok(())
            }
            LogEntryBody::CreatePage { change, after } => {
                ctx.redo_page(change, after, true).await
            }
            LogEntryBody::ModifyPage { change, after, .. } => {
                ctx.redo_page(change, after, false).await
            }
            LogEntryBody::DeletePage { change, .. } => {
                ctx.redo_page(change, &ZERO_PAGE, false).await
            }
        }
    }

    /// Undoes this entry's effect. Checkpoints are never rolled back.
    pub async fn roll_back(&self, ctx: &RecoveryContext) -> StorageResult<()> {
        match &self.body {
            LogEntryBody::NoOp
            | LogEntryBody::BeginCheckpoint(_)
            | LogEntryBody::EndCheckpoint(_)
            | LogEntryBody::CommitXact(_)
            | LogEntryBody::RollbackXact(_) => Ok(()),
            LogEntryBody::BeginXact(id) => {
                ctx.end_transaction(*id);
                Ok(())
            }
            LogEntryBody::CreatePage { change, .. } => {
                ctx.undo_page(change, &ZERO_PAGE, true).await
            }
            LogEntryBody::ModifyPage { change, before, .. }
            | LogEntryBody::DeletePage { change, before } => {
                ctx.undo_page(change, before, false).await
            }
        }
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LogEntry");
        debug
            .field("kind", &self.kind())
            .field("log_id", &self.log_id)
            .field("last_log", &self.last_log);
        if let Some(id) = self.transaction_id() {
            debug.field("transaction_id", &id);
        }
        if let Some(change) = self.page_change() {
            debug
                .field("page", &change.virtual_page_id)
                .field("timestamp", &change.timestamp);
        }
        if !self.active_transactions().is_empty() {
            debug.field("active", &self.active_transactions());
        }
        debug.finish()
    }
}

static ZERO_PAGE: PageData = [0u8; PAGE_SIZE];

fn write_page_change<W: Write>(writer: &mut W, change: &PageChange) -> StorageResult<()> {
    writer.write_u32::<LittleEndian>(change.transaction_id.value())?;
    writer.write_u64::<LittleEndian>(change.virtual_page_id.as_u64())?;
    writer.write_i64::<LittleEndian>(change.timestamp)?;
    Ok(())
}

fn read_page_change<R: Read>(reader: &mut R) -> StorageResult<PageChange> {
    let transaction_id = read_transaction_id(reader)?;
    let virtual_page_id = VirtualPageId::from_u64(reader.read_u64::<LittleEndian>()?);
    let timestamp = reader.read_i64::<LittleEndian>()?;
    Ok(PageChange {
        transaction_id,
        virtual_page_id,
        timestamp,
    })
}

fn read_transaction_id<R: Read>(reader: &mut R) -> StorageResult<TransactionId> {
    Ok(TransactionId::new(reader.read_u32::<LittleEndian>()?))
}

fn read_image<R: Read>(reader: &mut R) -> StorageResult<Box<PageData>> {
    let mut image = Box::new([0u8; PAGE_SIZE]);
    reader.read_exact(&mut image[..])?;
    Ok(image)
}

fn read_active<R: Read>(reader: &mut R) -> StorageResult<Vec<ActiveTransaction>> {
    let count = reader.read_u16::<LittleEndian>()?;
    (0..count)
        .map(|_| ActiveTransaction::read_from(reader))
        .collect()
}

/// State shared by the entries replayed during one recovery pass.
pub struct RecoveryContext {
    device: Arc<dyn CachingPageBufferDevice>,
    active: Mutex<HashSet<TransactionId>>,
}

impl RecoveryContext {
    pub fn new(device: Arc<dyn CachingPageBufferDevice>) -> Self {
        Self {
            device,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn CachingPageBufferDevice> {
        &self.device
    }

    pub fn begin_transaction(&self, id: TransactionId) {
        self.active.lock().insert(id);
    }

    pub fn end_transaction(&self, id: TransactionId) {
        self.active.lock().remove(&id);
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        self.active.lock().contains(&id)
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut active: Vec<_> = self.active.lock().iter().copied().collect();
        active.sort();
        active
    }

    async fn redo_page(
        &self,
        change: &PageChange,
        image: &PageData,
        create: bool,
    ) -> StorageResult<()> {
        let page_id = change.virtual_page_id;
        let guard = match self.device.fetch_page(page_id).await {
            Ok(guard) => guard,
            // A created page may never have reached the device.
            Err(err) if create && matches!(err.root(), StorageError::Io(_)) => {
                self.device.init_page(page_id).await?
            }
            Err(err) => return Err(err),
        };

        // Timestamps are not stored with the page, so 0 proves nothing
        if change.timestamp != 0 && guard.timestamp() == change.timestamp {
            trace!("{} already at {}, skipping redo", page_id, change.timestamp);
            return Ok(());
        }
        guard.apply_image(image, change.timestamp)?;
        trace!("redo {} -> {}", page_id, change.timestamp);
        Ok(())
    }

    async fn undo_page(
        &self,
        change: &PageChange,
        image: &PageData,
        create: bool,
    ) -> StorageResult<()> {
        let guard = match self.device.fetch_page(change.virtual_page_id).await {
            Ok(guard) => guard,
            // Nothing to undo for a created page that never reached the device.
            Err(err) if create && matches!(err.root(), StorageError::Io(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        guard.apply_image(image, 0)?;
        trace!("undo {} ({})", change.virtual_page_id, change.transaction_id);
        Ok(())
    }
}
