pub mod concurrency;
pub mod recovery;
pub mod storage;
pub mod transaction;
