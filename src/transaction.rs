//! Transaction identifiers.

pub mod id;

pub use id::{TransactionId, TransactionIdGenerator};
