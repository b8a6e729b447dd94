//! Table definitions for post-processed items
//!
//! Table names are derived from target names, so they are checked before
//! being spliced into SQL.

use crate::storage::traits::{StorageError, StorageResult};

/// Name of the item table of a target
pub fn items_table(target: &str) -> StorageResult<String> {
    let valid = !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StorageError::InvalidTable(target.to_string()));
    }
    Ok(format!("{}_items", target))
}

/// SQL creating the item table of a target
pub fn items_table_sql(target: &str) -> StorageResult<String> {
    let table = items_table(target)?;
    Ok(format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    item_id TEXT PRIMARY KEY,
    name TEXT,
    url TEXT,
    image_urls TEXT NOT NULL,
    image_file_paths TEXT NOT NULL,
    processed_at TEXT NOT NULL
);
"#
    ))
}

/// Initializes the item table of a target
pub fn initialize_items_table(conn: &rusqlite::Connection, target: &str) -> StorageResult<()> {
    conn.execute_batch(&items_table_sql(target)?)?;
    Ok(())
}
