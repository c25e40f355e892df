//! Vector cache
//!
//! Embeddings are expensive, so every computed vector is kept under
//! `(chunk id, owning-file fingerprint)`. An unchanged file never needs its
//! chunks embedded again, across runs when the SQLite cache is used.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteVectorCache;

use crate::Result;
use crate::config::CacheConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Key of a cached vector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub chunk_id: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(chunk_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// External store for computed vectors
pub trait VectorCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>>;

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()>;

    /// Store a batch; the default just loops
    fn put_many(&self, entries: &[(CacheKey, Vec<f32>)]) -> Result<()> {
        for (key, vector) in entries {
            self.put(key, vector)?;
        }
        Ok(())
    }

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Process-local cache, used when no cache file is configured
#[derive(Debug, Default)]
pub struct MemoryVectorCache {
    entries: Mutex<HashMap<CacheKey, Vec<f32>>>,
}

impl MemoryVectorCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorCache for MemoryVectorCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.clone(), vector.to_vec());
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}

/// Open the cache described by `config`
pub fn cache_from_config(config: &CacheConfig) -> Result<Arc<dyn VectorCache>> {
    match &config.path {
        Some(path) => Ok(Arc::new(SqliteVectorCache::open(path)?)),
        None => Ok(Arc::new(MemoryVectorCache::new())),
    }
}
