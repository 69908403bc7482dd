//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage and node layers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Wrong page size: expected {expected} bytes, got {actual}")]
    WrongPageSize { expected: usize, actual: usize },

    #[error("Duplicate page id: {0}")]
    DuplicatePageId(PageId),

    #[error("Resource is not open: {0}")]
    ResourceNotOpen(String),

    #[error("Resource already open: {0}")]
    AlreadyOpen(String),

    #[error("Page {0} is reserved and cannot be removed")]
    ReservedPage(PageId),

    #[error("Structural corruption: {0}")]
    StructuralCorruption(String),

    #[error("Serialized value of {length} bytes exceeds the fixed length of {max}")]
    SerializationOverflow { length: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::StructuralCorruption(msg.into())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
