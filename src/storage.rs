/*
Row Storage over sled
✅ One sled tree per table, rows serialized as JSON maps
✅ Full-image writes (the executor owns merge semantics)
✅ Monotonic sequence numbers for history ordering
*/

use sled::Db;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PolicyError, PolicyResult};

/// A row image: column name -> value. An absent key represents SQL NULL.
pub type Row = HashMap<String, String>;

pub struct Storage {
    db: Arc<Db>,
}

impl Storage {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Insert a full row image under the given key
    pub fn insert(&self, table: &str, key: &str, row: &Row) -> PolicyResult<()> {
        let tree = self.db.open_tree(table.as_bytes())?;
        let value = serde_json::to_vec(row)?;
        tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Read a row image by key
    pub fn select(&self, table: &str, key: &str) -> PolicyResult<Option<Row>> {
        let tree = self.db.open_tree(table.as_bytes())?;
        match tree.get(key.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Overwrite a row with a full new image
    pub fn update(&self, table: &str, key: &str, row: &Row) -> PolicyResult<()> {
        self.insert(table, key, row)
    }

    /// Physically remove a row
    pub fn delete(&self, table: &str, key: &str) -> PolicyResult<()> {
        let tree = self.db.open_tree(table.as_bytes())?;
        tree.remove(key.as_bytes())?;
        Ok(())
    }

    /// All (key, row) pairs of a table in key order
    pub fn scan(&self, table: &str) -> PolicyResult<Vec<(String, Row)>> {
        let tree = self.db.open_tree(table.as_bytes())?;
        let mut rows = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            let row: Row = serde_json::from_slice(&value)?;
            rows.push((key_str, row));
        }
        Ok(rows)
    }

    pub fn row_count(&self, table: &str) -> PolicyResult<usize> {
        let tree = self.db.open_tree(table.as_bytes())?;
        Ok(tree.len())
    }

    /// Monotonic id used to order history rows
    pub fn next_sequence(&self) -> PolicyResult<u64> {
        self.db
            .generate_id()
            .map_err(|e| PolicyError::storage("generate_id", &e.to_string()))
    }

    pub fn db(&self) -> Arc<Db> {
        Arc::clone(&self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_select_delete_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("test.db")).unwrap());
        let storage = Storage::new(db);

        let mut row = Row::new();
        row.insert("id".to_string(), "1".to_string());
        row.insert("note".to_string(), "hello".to_string());

        storage.insert("notes", "1", &row).unwrap();
        let loaded = storage.select("notes", "1").unwrap().unwrap();
        assert_eq!(loaded.get("note").map(String::as_str), Some("hello"));

        storage.delete("notes", "1").unwrap();
        assert!(storage.select("notes", "1").unwrap().is_none());
    }

    #[test]
    fn test_sequences_are_monotonic() {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("test.db")).unwrap());
        let storage = Storage::new(db);

        let a = storage.next_sequence().unwrap();
        let b = storage.next_sequence().unwrap();
        assert!(b > a);
    }
}
