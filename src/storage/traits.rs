//! Storage traits and error types
//!
//! This module defines the trait interface for item stores and the
//! associated error types.

use crate::storage::ItemRecord;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid table name for target '{0}'")]
    InvalidTable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for per-target item tables
///
/// Each target owns one table, `<target>_items`, keyed by item id.
pub trait ItemStore {
    /// Creates the target's table if it does not exist yet
    fn ensure_table(&mut self, target: &str) -> StorageResult<()>;

    /// Inserts or updates an item
    ///
    /// # Returns
    ///
    /// `true` if the item id was not in the table before
    fn save_item(&mut self, target: &str, item: &ItemRecord) -> StorageResult<bool>;

    /// Every item of a target, ordered by item id
    fn list_items(&self, target: &str) -> StorageResult<Vec<ItemRecord>>;

    /// Number of items stored for a target
    fn count_items(&self, target: &str) -> StorageResult<u64>;
}
