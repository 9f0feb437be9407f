//! Concurrency control.
//!
//! Owner-tagged shared/update/exclusive locks over index roots, index pages
//! and data pages, with FIFO grants and per-request timeouts.

pub mod lock;

pub use lock::{DatabaseLockManager, LockId, LockManager, LockMode};
