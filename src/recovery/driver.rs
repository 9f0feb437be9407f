//! Crash recovery over a decoded transaction log.
//!
//! Recovery runs in three steps:
//! 1. Analysis: pick the scan start from the last complete checkpoint and
//!    sort transactions into winners (committed) and losers.
//! 2. Undo: roll back the losers' page changes, newest first.
//! 3. Redo: roll the winners' entries forward in log order.
//!
//! Undo runs before redo so a committed change to a page always wins over
//! an abandoned change to the same page, whatever order they were logged in.
//! Finally every dirty page is flushed.

use std::collections::HashSet;

use log::{debug, info, warn};
use thiserror::Error;

use super::log_entry::{LogEntry, LogEntryBody, RecoveryContext};
use crate::storage::buffer::FlushParams;
use crate::storage::error::StorageError;
use crate::transaction::id::TransactionId;

/// Fatal errors raised while bringing a database online.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Database cannot be opened: replay of log entry {log_id} failed: {source}")]
    DatabaseOpen {
        log_id: u32,
        #[source]
        source: StorageError,
    },

    #[error("Database cannot be opened: flushing recovered pages failed: {0}")]
    Flush(#[source] StorageError),
}

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Log id recovery started scanning from.
    pub start_log_id: u32,
    /// Transactions whose changes were rolled forward.
    pub committed: Vec<TransactionId>,
    /// Transactions whose changes were rolled back.
    pub rolled_back: Vec<TransactionId>,
    /// Entries rolled forward.
    pub redone: usize,
    /// Entries rolled back.
    pub undone: usize,
}

/// Index of the first entry recovery has to look at.
fn scan_start(entries: &[LogEntry]) -> usize {
    let Some(end) = entries
        .iter()
        .rposition(|e| matches!(e.body, LogEntryBody::EndCheckpoint(_)))
    else {
        return 0;
    };

    // The matching begin carries the transactions open while pages were
    // being flushed; their earlier entries still need replaying.
    let begin = entries[..end]
        .iter()
        .rposition(|e| matches!(e.body, LogEntryBody::BeginCheckpoint(_)))
        .unwrap_or(end);

    let first_log_id = entries[begin]
        .first_protected_transaction()
        .into_iter()
        .chain(entries[end].first_protected_transaction())
        .map(|active| active.first_log_id)
        .min();

    match first_log_id {
        Some(log_id) => entries
            .iter()
            .position(|e| e.log_id == log_id)
            .unwrap_or(0)
            .min(begin),
        None => begin,
    }
}

/// Replays `entries` (in log order) against the pages reachable from `ctx`.
pub async fn recover(
    entries: &[LogEntry],
    ctx: &RecoveryContext,
) -> Result<RecoveryReport, RecoveryError> {
    let start = scan_start(entries);
    let scanned = &entries[start..];
    let mut report = RecoveryReport {
        start_log_id: scanned.first().map_or(0, |e| e.log_id),
        ..RecoveryReport::default()
    };

    // Analysis
    let mut seen = Vec::new();
    let mut committed = HashSet::new();
    for entry in scanned {
        if let Some(id) = entry.transaction_id() {
            if !seen.contains(&id) {
                seen.push(id);
            }
            if matches!(entry.body, LogEntryBody::CommitXact(_)) {
                committed.insert(id);
            }
        }
    }
    let losers: HashSet<TransactionId> = seen
        .iter()
        .copied()
        .filter(|id| !committed.contains(id))
        .collect();
    report.committed = seen.iter().copied().filter(|id| committed.contains(id)).collect();
    report.rolled_back = seen.iter().copied().filter(|id| losers.contains(id)).collect();
    debug!(
        "Recovery from log id {}: {} committed, {} to roll back",
        report.start_log_id,
        report.committed.len(),
        report.rolled_back.len()
    );

    // Undo
    for entry in scanned.iter().rev() {
        match entry.transaction_id() {
            Some(id) if losers.contains(&id) => {
                entry
                    .roll_back(ctx)
                    .await
                    .map_err(|source| fail(entry, source))?;
                report.undone += 1;
            }
            _ => {}
        }
    }

    // Redo
    for entry in scanned {
        match entry.transaction_id() {
            Some(id) if committed.contains(&id) => {
                entry
                    .roll_forward(ctx)
                    .await
                    .map_err(|source| fail(entry, source))?;
                report.redone += 1;
            }
            _ => {}
        }
    }

    ctx.device()
        .flush_pages(FlushParams::checkpoint())
        .await
        .map_err(RecoveryError::Flush)?;

    info!(
        "Recovery complete: {} entries redone, {} undone",
        report.redone, report.undone
    );
    Ok(report)
}

fn fail(entry: &LogEntry, source: StorageError) -> RecoveryError {
    warn!("Recovery failed at {:?}: {}", entry, source);
    RecoveryError::DatabaseOpen {
        log_id: entry.log_id,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::log_entry::ActiveTransaction;

    fn entry(log_id: u32, body: LogEntryBody) -> LogEntry {
        LogEntry {
            log_id,
            last_log: 0,
            body,
        }
    }

    #[test]
    fn test_scan_start_without_checkpoint() {
        let entries = vec![
            entry(1, LogEntryBody::BeginXact(TransactionId(1))),
            entry(2, LogEntryBody::CommitXact(TransactionId(1))),
        ];
        assert_eq!(scan_start(&entries), 0);
    }

    #[test]
    fn test_scan_start_follows_protected_transaction() {
        let active = vec![ActiveTransaction {
            transaction_id: TransactionId(2),
            file_id: 0,
            file_offset: 0,
            first_log_id: 2,
        }];
        let entries = vec![
            entry(1, LogEntryBody::NoOp),
            entry(2, LogEntryBody::BeginXact(TransactionId(2))),
            entry(3, LogEntryBody::BeginCheckpoint(active.clone())),
            entry(4, LogEntryBody::EndCheckpoint(active)),
            entry(5, LogEntryBody::CommitXact(TransactionId(2))),
        ];
        assert_eq!(scan_start(&entries), 1);
    }

    #[test]
    fn test_scan_start_at_checkpoint_when_idle() {
        let entries = vec![
            entry(1, LogEntryBody::BeginXact(TransactionId(1))),
            entry(2, LogEntryBody::CommitXact(TransactionId(1))),
            entry(3, LogEntryBody::BeginCheckpoint(Vec::new())),
            entry(4, LogEntryBody::EndCheckpoint(Vec::new())),
        ];
        assert_eq!(scan_start(&entries), 2);
    }
}
