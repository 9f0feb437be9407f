//! In-memory transaction log.
//!
//! Assigns log ids, chains each transaction's entries through `last_log`
//! and keeps the active transaction table that checkpoints record.

use std::collections::HashMap;
use std::io::Cursor;

use log::debug;
use parking_lot::Mutex;

use super::log_entry::{ActiveTransaction, LogEntry, LogEntryBody};
use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::id::TransactionId;

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    /// Log id 0 is never assigned. Here it means the id space is used up.
    next_log_id: u32,
    /// Encoded size of every entry appended so far.
    byte_len: u64,
    /// Last log id and first-entry record per open transaction.
    active: HashMap<TransactionId, (u32, ActiveTransaction)>,
}

/// Append-only log of [`LogEntry`] records.
#[derive(Debug)]
pub struct TransactionLog {
    file_id: u16,
    state: Mutex<LogState>,
}

impl TransactionLog {
    pub fn new(file_id: u16) -> Self {
        Self {
            file_id,
            state: Mutex::new(LogState {
                next_log_id: 1,
                ..LogState::default()
            }),
        }
    }

    /// Rebuilds the log from entries read back from storage. Transactions
    /// without a commit or rollback entry are considered still open.
    pub fn from_entries(file_id: u16, entries: Vec<LogEntry>) -> Self {
        let log = Self::new(file_id);
        {
            let mut state = log.state.lock();
            for entry in entries {
                let size = entry.raw_size() as u64;
                match &entry.body {
                    LogEntryBody::BeginXact(id) => {
                        let first = ActiveTransaction {
                            transaction_id: *id,
                            file_id,
                            file_offset: state.byte_len as u32,
                            first_log_id: entry.log_id,
                        };
                        state.active.insert(*id, (entry.log_id, first));
                    }
                    LogEntryBody::CommitXact(id) | LogEntryBody::RollbackXact(id) => {
                        state.active.remove(id);
                    }
                    _ => {
                        if let Some(id) = entry.transaction_id() {
                            if let Some((last, _)) = state.active.get_mut(&id) {
                                *last = entry.log_id;
                            }
                        }
                    }
                }
                state.next_log_id = match entry.log_id.checked_add(1) {
                    Some(after) if state.next_log_id != 0 => state.next_log_id.max(after),
                    _ => 0,
                };
                state.byte_len += size;
                state.entries.push(entry);
            }
        }
        log
    }

    fn push(state: &mut LogState, mut entry: LogEntry, last_log: u32) -> StorageResult<u32> {
        let log_id = state.next_log_id;
        if log_id == 0 {
            return Err(StorageError::InvariantViolation(
                "transaction log ids are exhausted".to_string(),
            ));
        }
        state.next_log_id = log_id.checked_add(1).unwrap_or(0);
        entry.log_id = log_id;
        entry.last_log = last_log;
        state.byte_len += entry.raw_size() as u64;
        state.entries.push(entry);
        Ok(log_id)
    }

    /// Starts a transaction. Its `BeginXact` entry ends every chain.
    pub fn begin(&self, transaction_id: TransactionId) -> StorageResult<u32> {
        let mut state = self.state.lock();
        if state.active.contains_key(&transaction_id) {
            return Err(StorageError::InvariantViolation(format!(
                "{} is already active",
                transaction_id
            )));
        }

        let file_offset = state.byte_len as u32;
        let log_id = Self::push(&mut state, LogEntry::begin_xact(transaction_id), 0)?;
        let first = ActiveTransaction {
            transaction_id,
            file_id: self.file_id,
            file_offset,
            first_log_id: log_id,
        };
        state.active.insert(transaction_id, (log_id, first));
        Ok(log_id)
    }

    /// Appends a page entry produced by `PageBuffer::commit`.
    pub fn append_page_change(&self, entry: LogEntry) -> StorageResult<u32> {
        let transaction_id = match (entry.page_change(), entry.transaction_id()) {
            (Some(_), Some(id)) => id,
            _ => {
                return Err(StorageError::Other(format!(
                    "{:?} is not a page change",
                    entry.kind()
                )))
            }
        };
        let mut state = self.state.lock();
        Self::append_chained(&mut state, transaction_id, entry)
    }

    pub fn commit(&self, transaction_id: TransactionId) -> StorageResult<u32> {
        self.finish(transaction_id, LogEntry::commit_xact(transaction_id))
    }

    pub fn rollback(&self, transaction_id: TransactionId) -> StorageResult<u32> {
        self.finish(transaction_id, LogEntry::rollback_xact(transaction_id))
    }

    fn finish(&self, transaction_id: TransactionId, entry: LogEntry) -> StorageResult<u32> {
        let log_id = {
            let mut state = self.state.lock();
            let log_id = Self::append_chained(&mut state, transaction_id, entry)?;
            state.active.remove(&transaction_id);
            log_id
        };
        debug!("{} finished at log id {}", transaction_id, log_id);
        Ok(log_id)
    }

    fn append_chained(
        state: &mut LogState,
        transaction_id: TransactionId,
        entry: LogEntry,
    ) -> StorageResult<u32> {
        let last_log = match state.active.get(&transaction_id) {
            Some((last, _)) => *last,
            None => {
                return Err(StorageError::InvariantViolation(format!(
                    "{} is not active",
                    transaction_id
                )))
            }
        };
        let log_id = Self::push(state, entry, last_log)?;
        if let Some((last, _)) = state.active.get_mut(&transaction_id) {
            *last = log_id;
        }
        Ok(log_id)
    }

    /// Open transactions ordered by their first log id.
    pub fn active_transactions(&self) -> Vec<ActiveTransaction> {
        Self::active_in(&self.state.lock())
    }

    fn active_in(state: &LogState) -> Vec<ActiveTransaction> {
        let mut active: Vec<_> = state.active.values().map(|(_, first)| *first).collect();
        active.sort_by_key(|first| first.first_log_id);
        active
    }

    /// The recorded table matches the log at the checkpoint's position.
    pub fn begin_checkpoint(&self) -> StorageResult<u32> {
        let mut state = self.state.lock();
        let active = Self::active_in(&state);
        Self::push(
            &mut state,
            LogEntry::new(LogEntryBody::BeginCheckpoint(active)),
            0,
        )
    }

    pub fn end_checkpoint(&self) -> StorageResult<u32> {
        let mut state = self.state.lock();
        let active = Self::active_in(&state);
        Self::push(
            &mut state,
            LogEntry::new(LogEntryBody::EndCheckpoint(active)),
            0,
        )
    }

    pub fn no_op(&self) -> StorageResult<u32> {
        let mut state = self.state.lock();
        Self::push(&mut state, LogEntry::no_op(), 0)
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, log_id: u32) -> Option<LogEntry> {
        let state = self.state.lock();
        state.entries.iter().find(|e| e.log_id == log_id).cloned()
    }

    /// Log ids of a transaction's entries, newest first, following `last_log`.
    pub fn chain(&self, transaction_id: TransactionId) -> Vec<u32> {
        let state = self.state.lock();
        let by_id: HashMap<u32, &LogEntry> = state.entries.iter().map(|e| (e.log_id, e)).collect();

        let mut current = state
            .entries
            .iter()
            .rev()
            .find(|e| e.transaction_id() == Some(transaction_id))
            .map(|e| e.log_id);

        let mut chain = Vec::new();
        while let Some(log_id) = current {
            chain.push(log_id);
            current = by_id
                .get(&log_id)
                .map(|e| e.last_log)
                .filter(|last| *last != 0);
        }
        chain
    }

    /// Encodes every entry into one contiguous stream.
    pub fn encode_all(&self) -> StorageResult<Vec<u8>> {
        let state = self.state.lock();
        let mut bytes = Vec::with_capacity(state.byte_len as usize);
        for entry in &state.entries {
            entry.write_entry(&mut bytes)?;
        }
        Ok(bytes)
    }

    pub fn decode_all(bytes: &[u8]) -> StorageResult<Vec<LogEntry>> {
        let mut cursor = Cursor::new(bytes);
        let mut entries = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            entries.push(LogEntry::read_entry(&mut cursor)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::log_entry::{LogEntryKind, PageChange};
    use crate::storage::page::{DeviceId, VirtualPageId};
    use crate::storage::PAGE_SIZE;

    fn page_entry(txn: TransactionId, ts: i64) -> LogEntry {
        LogEntry::modify_page(
            PageChange {
                transaction_id: txn,
                virtual_page_id: VirtualPageId::new(DeviceId(1), 3),
                timestamp: ts,
            },
            Box::new([0u8; PAGE_SIZE]),
            Box::new([1u8; PAGE_SIZE]),
        )
    }

    #[test]
    fn test_chain_links_previous_entry() {
        let log = TransactionLog::new(0);
        let txn = TransactionId(1);

        let begin = log.begin(txn).unwrap();
        let first = log.append_page_change(page_entry(txn, 1)).unwrap();
        let second = log.append_page_change(page_entry(txn, 2)).unwrap();
        let commit = log.commit(txn).unwrap();

        let entries = log.entries();
        assert_eq!(entries[0].last_log, 0);
        assert_eq!(entries[1].last_log, begin);
        assert_eq!(entries[2].last_log, first);
        assert_eq!(entries[3].last_log, second);
        assert_eq!(log.chain(txn), vec![commit, second, first, begin]);
        assert!(log.active_transactions().is_empty());
    }

    #[test]
    fn test_interleaved_transactions_keep_separate_chains() {
        let log = TransactionLog::new(0);
        let a = TransactionId(1);
        let b = TransactionId(2);

        let a_begin = log.begin(a).unwrap();
        let b_begin = log.begin(b).unwrap();
        let a_page = log.append_page_change(page_entry(a, 1)).unwrap();
        let b_page = log.append_page_change(page_entry(b, 2)).unwrap();

        assert_eq!(log.chain(a), vec![a_page, a_begin]);
        assert_eq!(log.chain(b), vec![b_page, b_begin]);
    }

    #[test]
    fn test_rejects_unknown_transaction() {
        let log = TransactionLog::new(0);
        assert!(log.commit(TransactionId(4)).is_err());
        assert!(log
            .append_page_change(page_entry(TransactionId(4), 1))
            .is_err());
        assert!(log.append_page_change(LogEntry::no_op()).is_err());

        log.begin(TransactionId(4)).unwrap();
        assert!(log.begin(TransactionId(4)).is_err());
    }

    #[test]
    fn test_checkpoint_records_active_transactions() {
        let log = TransactionLog::new(3);
        log.begin(TransactionId(1)).unwrap();
        log.begin(TransactionId(2)).unwrap();
        log.commit(TransactionId(1)).unwrap();

        let checkpoint = log.begin_checkpoint().unwrap();
        let entry = log.entry(checkpoint).unwrap();
        assert_eq!(entry.kind(), LogEntryKind::BeginCheckpoint);

        let active = entry.active_transactions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].transaction_id, TransactionId(2));
        assert_eq!(active[0].file_id, 3);
        assert_eq!(active[0].first_log_id, 2);
        // BeginXact entries are 13 bytes each
        assert_eq!(active[0].file_offset, 13);
    }

    #[test]
    fn test_checkpoints_match_concurrent_activity() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let log = Arc::new(TransactionLog::new(0));
        let workers: Vec<_> = (0..4u32)
            .map(|worker| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for n in 0..50 {
                        let txn = TransactionId(worker * 1000 + n + 1);
                        log.begin(txn).unwrap();
                        log.append_page_change(page_entry(txn, n as i64)).unwrap();
                        log.commit(txn).unwrap();
                    }
                })
            })
            .collect();
        let checkpointer = {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for _ in 0..100 {
                    log.begin_checkpoint().unwrap();
                    log.end_checkpoint().unwrap();
                }
            })
        };
        for handle in workers {
            handle.join().unwrap();
        }
        checkpointer.join().unwrap();

        let mut active = HashSet::new();
        for entry in log.entries() {
            match &entry.body {
                LogEntryBody::BeginXact(id) => {
                    active.insert(*id);
                }
                LogEntryBody::CommitXact(id) | LogEntryBody::RollbackXact(id) => {
                    active.remove(id);
                }
                LogEntryBody::BeginCheckpoint(_) | LogEntryBody::EndCheckpoint(_) => {
                    let recorded: HashSet<_> = entry
                        .active_transactions()
                        .iter()
                        .map(|first| first.transaction_id)
                        .collect();
                    assert_eq!(recorded, active, "checkpoint at {}", entry.log_id);
                }
                _ => {}
            }
        }
        assert!(active.is_empty());
    }

    #[test]
    fn test_log_ids_run_out_without_wrapping() {
        let mut last = LogEntry::no_op();
        last.log_id = u32::MAX;
        let log = TransactionLog::from_entries(0, vec![last]);

        assert!(matches!(
            log.begin(TransactionId(1)),
            Err(StorageError::InvariantViolation(_))
        ));
        assert!(log.no_op().is_err());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_encode_decode_and_resume() {
        let log = TransactionLog::new(0);
        let txn = TransactionId(7);
        log.begin(txn).unwrap();
        log.append_page_change(page_entry(txn, 1)).unwrap();
        log.no_op().unwrap();

        let bytes = log.encode_all().unwrap();
        let decoded = TransactionLog::decode_all(&bytes).unwrap();
        assert_eq!(decoded, log.entries());

        let resumed = TransactionLog::from_entries(0, decoded);
        assert_eq!(resumed.active_transactions().len(), 1);
        let commit = resumed.commit(txn).unwrap();
        assert_eq!(commit, 4);
        assert_eq!(resumed.entry(commit).unwrap().last_log, 2);
    }
}
