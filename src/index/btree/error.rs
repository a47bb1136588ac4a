use thiserror::Error;

use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("failed to encode node: {0}")]
    Serialization(String),

    #[error("failed to decode node: {0}")]
    Deserialization(String),

    #[error("node does not fit in a page")]
    NodeTooLarge,

    #[error("header page has no room for another index record")]
    HeaderFull,

    #[error("index structure is corrupted: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
