pub mod concurrency;

pub use concurrency::{
    IsolationLevel, LockManager, Transaction, TransactionError, TransactionManager,
    TransactionState,
};
