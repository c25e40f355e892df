//! SQLite vector cache implementation

use super::{CacheKey, VectorCache, schema};
use crate::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// SQLite-backed vector cache.
///
/// Vectors are stored as little-endian `f32` blobs.
pub struct SqliteVectorCache {
    conn: Mutex<Connection>,
}

impl SqliteVectorCache {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        crate::config::ensure_parent_dir(path)?;
        let conn = Connection::open(path)?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn();
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, [])?;
        }
        Ok(())
    }

    /// Drop every cached vector belonging to `chunk_id`, whatever its fingerprint
    pub fn evict_chunk(&self, chunk_id: &str) -> Result<usize> {
        let removed = self
            .conn()
            .execute("DELETE FROM embeddings WHERE chunk_id = ?1", [chunk_id])?;
        Ok(removed)
    }

    /// Clear all data
    pub fn clear(&self) -> Result<()> {
        self.conn().execute("DELETE FROM embeddings", [])?;
        Ok(())
    }
}

fn encode(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl VectorCache for SqliteVectorCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT vector FROM embeddings WHERE chunk_id = ?1 AND fingerprint = ?2",
                params![key.chunk_id, key.fingerprint],
                |row| row.get(0),
            )
            .optional()?;

        Ok(blob.map(|blob| decode(&blob)))
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, fingerprint, dimensions, vector) VALUES (?1, ?2, ?3, ?4)",
            params![key.chunk_id, key.fingerprint, vector.len() as i64, encode(vector)],
        )?;
        Ok(())
    }

    /// Store a batch in one transaction
    fn put_many(&self, entries: &[(CacheKey, Vec<f32>)]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (chunk_id, fingerprint, dimensions, vector) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (key, vector) in entries {
                stmt.execute(params![
                    key.chunk_id,
                    key.fingerprint,
                    vector.len() as i64,
                    encode(vector)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
