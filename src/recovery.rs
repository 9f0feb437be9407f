//! Logging and crash recovery.
//!
//! This module handles:
//! - The binary log entry format and its roll-forward/roll-back replay
//! - An in-memory transaction log with per-transaction chains and checkpoints
//! - The recovery pass run when a database is opened

pub mod driver;
pub mod log_entry;
pub mod transaction_log;

// Re-export commonly used types
pub use driver::{recover, RecoveryError, RecoveryReport};
pub use log_entry::{
    ActiveTransaction, LogEntry, LogEntryBody, LogEntryKind, PageChange, RecoveryContext,
};
pub use transaction_log::TransactionLog;
