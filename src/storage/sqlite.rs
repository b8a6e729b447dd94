//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the ItemStore trait.

use crate::storage::schema::{initialize_items_table, items_table};
use crate::storage::traits::{ItemStore, StorageResult};
use crate::storage::ItemRecord;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens or creates the database file
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> StorageResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }
}

impl ItemStore for SqliteStorage {
    fn ensure_table(&mut self, target: &str) -> StorageResult<()> {
        initialize_items_table(&self.conn, target)
    }

    fn save_item(&mut self, target: &str, item: &ItemRecord) -> StorageResult<bool> {
        let table = items_table(target)?;
        let image_urls = serde_json::to_string(&item.image_urls)?;

        let tx = self.conn.transaction()?;
        let existed = tx
            .query_row(
                &format!("SELECT 1 FROM {} WHERE item_id = ?1", table),
                params![item.item_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            &format!(
                "INSERT INTO {} (item_id, name, url, image_urls, image_file_paths, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(item_id) DO UPDATE SET
                    name = excluded.name,
                    url = excluded.url,
                    image_urls = excluded.image_urls,
                    image_file_paths = excluded.image_file_paths,
                    processed_at = excluded.processed_at",
                table
            ),
            params![
                item.item_id,
                item.name,
                item.url,
                image_urls,
                item.image_file_paths,
                item.processed_at
            ],
        )?;
        tx.commit()?;

        Ok(!existed)
    }

    fn list_items(&self, target: &str) -> StorageResult<Vec<ItemRecord>> {
        let table = items_table(target)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT item_id, name, url, image_urls, image_file_paths, processed_at
             FROM {} ORDER BY item_id",
            table
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (item_id, name, url, image_urls, image_file_paths, processed_at) = row?;
            items.push(ItemRecord {
                item_id,
                name,
                url,
                image_urls: serde_json::from_str(&image_urls)?,
                image_file_paths,
                processed_at,
            });
        }
        Ok(items)
    }

    fn count_items(&self, target: &str) -> StorageResult<u64> {
        let table = items_table(target)?;
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }
}
