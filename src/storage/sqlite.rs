//! SQLite-backed durable map.
//!
//! One table, keyed by blob. `synchronous=FULL` so a completed put has been
//! fsynced; the acceptor's safety argument depends on it.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{DurableMap, StorageError};

pub struct SqliteMap {
    conn: Mutex<Connection>,
}

impl SqliteMap {
    pub fn open(path: &Path) -> Result<SqliteMap, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=FULL;\n\
             CREATE TABLE IF NOT EXISTS slots (\n\
                 key   BLOB PRIMARY KEY,\n\
                 value BLOB NOT NULL\n\
             ) WITHOUT ROWID;",
        )?;
        Ok(SqliteMap {
            conn: Mutex::new(conn),
        })
    }
}

impl DurableMap for SqliteMap {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let value = conn
            .query_row(
                "SELECT value FROM slots WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT INTO slots (key, value) VALUES (?1, ?2)\n\
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn puts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slots.db");

        let map = SqliteMap::open(&path).unwrap();
        map.put(b"key", b"before").unwrap();
        map.put(b"key", b"after").unwrap();
        map.put(b"other", b"").unwrap();
        drop(map);

        let map = SqliteMap::open(&path).unwrap();
        assert_eq!(map.get(b"key").unwrap(), Some(b"after".to_vec()));
        assert_eq!(map.get(b"other").unwrap(), Some(Vec::new()));
        assert_eq!(map.get(b"absent").unwrap(), None);
    }

    #[test]
    fn binary_keys_are_preserved_exactly() {
        let dir = TempDir::new().unwrap();
        let map = SqliteMap::open(&dir.path().join("slots.db")).unwrap();

        let key = [0u8, 255, b'A', 0, 10];
        map.put(&key, &[1, 2, 3]).unwrap();
        assert_eq!(map.get(&key).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(map.get(&key[..4]).unwrap(), None);
    }
}
