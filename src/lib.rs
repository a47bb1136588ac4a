// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::config::DbConfig;
pub use index::btree::{BPlusTree, BTreeError, TreeIterator};
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use storage::disk::DiskManager;
pub use transaction::concurrency::{
    IsolationLevel, LockManager, Transaction, TransactionManager, TransactionState,
};
