//! In-memory embedding index with brute-force cosine search

use super::{EmbeddingProvider, cosine_similarity};
use crate::chunk::{ChunkMeta, CodeChunk};
use crate::source::{SnapshotStore, fingerprint};
use crate::storage::{CacheKey, VectorCache};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

/// Supplies the current fingerprint of a chunk's owning file
pub trait FingerprintSource {
    fn fingerprint_of(&self, file: &str) -> Option<String>;
}

impl FingerprintSource for SnapshotStore {
    fn fingerprint_of(&self, file: &str) -> Option<String> {
        self.get(file).map(|unit| unit.fingerprint().to_string())
    }
}

impl FingerprintSource for HashMap<String, String> {
    fn fingerprint_of(&self, file: &str) -> Option<String> {
        self.get(file).cloned()
    }
}

/// Chunks whose owning file is unknown fall back to a hash of their body.
pub struct BodyFingerprints;

impl FingerprintSource for BodyFingerprints {
    fn fingerprint_of(&self, _file: &str) -> Option<String> {
        None
    }
}

/// Outcome of one `index` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Vectors taken from the cache
    pub hits: usize,
    /// Vectors computed by the provider
    pub misses: usize,
    /// Entries in the index afterwards
    pub indexed: usize,
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cached, {} embedded, {} total",
            self.hits, self.misses, self.indexed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: ChunkMeta,
    pub score: f32,
}

/// On-disk form of the index
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    vectors: Vec<Vec<f32>>,
    chunk_ids: Vec<String>,
    chunks: HashMap<String, ChunkMeta>,
    provider: String,
    dimensions: usize,
}

/// Observer of the embedding work done by one `index` call.
///
/// Only called when at least one chunk misses the cache. Reporting is
/// best effort: implementations log their own failures.
pub trait IndexProgress: Send + Sync {
    /// `total` chunks are about to be embedded
    fn begin(&self, total: usize);

    /// `done` of `total` chunks have been embedded
    fn advance(&self, done: usize, total: usize);

    /// The embedding work ended, with the error that stopped it if any
    fn finish(&self, failure: Option<&Error>);
}

/// Vectors for a set of chunks, searchable by cosine similarity.
///
/// `vectors[i]` belongs to `chunk_ids[i]`; every id has metadata in `chunks`.
pub struct EmbeddingIndex {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn VectorCache>,
    vectors: Vec<Vec<f32>>,
    chunk_ids: Vec<String>,
    chunks: HashMap<String, ChunkMeta>,
    progress: Option<Arc<dyn IndexProgress>>,
}

impl EmbeddingIndex {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: Arc<dyn VectorCache>) -> Self {
        Self {
            provider,
            cache,
            vectors: Vec::new(),
            chunk_ids: Vec::new(),
            chunks: HashMap::new(),
            progress: None,
        }
    }

    /// Report embedding progress of every `index` call to `progress`
    pub fn with_progress(mut self, progress: Arc<dyn IndexProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.vectors.clear();
        self.chunk_ids.clear();
        self.chunks.clear();
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        let expected = self.provider.dimensions();
        if vector.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                found: vector.len(),
            });
        }
        Ok(())
    }

    /// Add `chunks`, embedding only those with no cached vector.
    ///
    /// Either every chunk is added or, on error, none are. A chunk whose id
    /// is already indexed has its vector and metadata replaced.
    pub fn index(
        &mut self,
        chunks: &[CodeChunk],
        files: &dyn FingerprintSource,
    ) -> Result<IndexReport> {
        let mut resolved: Vec<Option<Vec<f32>>> = vec![None; chunks.len()];
        let mut misses: Vec<(usize, CacheKey)> = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            let file_fingerprint = files
                .fingerprint_of(&chunk.file)
                .unwrap_or_else(|| fingerprint(&chunk.body));
            let key = CacheKey::new(&chunk.id, file_fingerprint);

            match self.cache.get(&key)? {
                Some(vector) if vector.len() == self.provider.dimensions() => {
                    resolved[i] = Some(vector);
                }
                _ => misses.push((i, key)),
            }
        }

        let hits = chunks.len() - misses.len();
        tracing::debug!("{} cache hits, {} misses", hits, misses.len());

        if !misses.is_empty() {
            if let Some(progress) = &self.progress {
                progress.begin(misses.len());
            }
            let outcome = self.embed_misses(chunks, &misses, &mut resolved);
            if let Some(progress) = &self.progress {
                progress.finish(outcome.as_ref().err());
            }
            outcome?;
        }

        let mut positions: HashMap<String, usize> = self
            .chunk_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        // A repeated id within one call is stored once; the last copy wins
        for (chunk, vector) in chunks.iter().zip(resolved) {
            let Some(vector) = vector else {
                continue;
            };
            match positions.get(&chunk.id) {
                Some(&pos) => self.vectors[pos] = vector,
                None => {
                    positions.insert(chunk.id.clone(), self.vectors.len());
                    self.vectors.push(vector);
                    self.chunk_ids.push(chunk.id.clone());
                }
            }
            self.chunks.insert(chunk.id.clone(), chunk.meta());
        }

        let report = IndexReport {
            hits,
            misses: misses.len(),
            indexed: self.len(),
        };
        tracing::info!("Indexed {} chunks ({})", chunks.len(), report);
        Ok(report)
    }

    fn embed_misses(
        &self,
        chunks: &[CodeChunk],
        misses: &[(usize, CacheKey)],
        resolved: &mut [Option<Vec<f32>>],
    ) -> Result<()> {
        let mut done = 0usize;

        for batch in misses.chunks(self.provider.max_batch_size().max(1)) {
            let texts: Vec<String> = batch.iter().map(|(i, _)| chunks[*i].body.clone()).collect();
            let vectors = self.provider.embed(&texts, false)?;

            if vectors.len() != batch.len() {
                return Err(Error::Provider(format!(
                    "{} returned {} vectors for {} inputs",
                    self.provider.name(),
                    vectors.len(),
                    batch.len()
                )));
            }

            let mut entries = Vec::with_capacity(batch.len());
            for ((i, key), vector) in batch.iter().zip(vectors) {
                self.check_dimensions(&vector)?;
                entries.push((key.clone(), vector.clone()));
                resolved[*i] = Some(vector);
            }
            self.cache.put_many(&entries)?;

            done += batch.len();
            if let Some(progress) = &self.progress {
                progress.advance(done, misses.len());
            }
        }

        Ok(())
    }

    /// Embed `query` and return the `top_k` closest chunks.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if self.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let vectors = self.provider.embed(&[query.to_string()], true)?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No embedding returned for query".to_string()))?;
        self.check_dimensions(&vector)?;

        Ok(self.search_vector(&vector, top_k))
    }

    /// Rank stored vectors against `vector`, best first.
    pub fn search_vector(&self, vector: &[f32], top_k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, stored)| (i, cosine_similarity(vector, stored)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(top_k)
            .filter_map(|(i, score)| {
                self.chunks.get(&self.chunk_ids[i]).map(|meta| SearchHit {
                    chunk: meta.clone(),
                    score,
                })
            })
            .collect()
    }

    /// Write the whole index to `path` as one JSON document.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::config::ensure_parent_dir(path)?;

        let persisted = PersistedIndex {
            vectors: self.vectors.clone(),
            chunk_ids: self.chunk_ids.clone(),
            chunks: self.chunks.clone(),
            provider: self.provider.name().to_string(),
            dimensions: self.provider.dimensions(),
        };

        let file = std::fs::File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), &persisted)?;
        tracing::info!("Saved {} vectors to {}", self.len(), path.display());
        Ok(())
    }

    /// Replace the index with the one saved at `path`.
    ///
    /// Fails without touching the current contents when the saved vectors
    /// were produced with a different dimensionality.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let file = std::fs::File::open(path)?;
        let persisted: PersistedIndex = serde_json::from_reader(BufReader::new(file))?;

        let expected = self.provider.dimensions();
        if persisted.dimensions != expected {
            return Err(Error::DimensionMismatch {
                expected,
                found: persisted.dimensions,
            });
        }

        if persisted.vectors.len() != persisted.chunk_ids.len() {
            return Err(Error::Parse(format!(
                "{}: {} vectors for {} chunk ids",
                path.display(),
                persisted.vectors.len(),
                persisted.chunk_ids.len()
            )));
        }
        if let Some(bad) = persisted.vectors.iter().find(|v| v.len() != expected) {
            return Err(Error::DimensionMismatch {
                expected,
                found: bad.len(),
            });
        }
        if let Some(orphan) = persisted
            .chunk_ids
            .iter()
            .find(|id| !persisted.chunks.contains_key(*id))
        {
            return Err(Error::Parse(format!(
                "{}: no metadata for chunk {}",
                path.display(),
                orphan
            )));
        }

        if persisted.provider != self.provider.name() {
            tracing::warn!(
                "Index at {} was built by {}, loading under {}",
                path.display(),
                persisted.provider,
                self.provider.name()
            );
        }

        self.vectors = persisted.vectors;
        self.chunk_ids = persisted.chunk_ids;
        self.chunks = persisted.chunks;

        tracing::info!("Loaded {} vectors from {}", self.len(), path.display());
        Ok(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::test_support::StubProvider;
    use crate::storage::MemoryVectorCache;
    use std::sync::Mutex;

    fn sample_chunks() -> Vec<CodeChunk> {
        vec![
            CodeChunk::new("c1", "src/lexer.rs", "tokenize", "fn tokenize parse tokens from input"),
            CodeChunk::new("c2", "src/net.rs", "connect", "fn connect open socket network"),
            CodeChunk::new("c3", "src/db.rs", "query", "fn query database rows sql")
                .with_parent("Store"),
        ]
    }

    fn fingerprints() -> HashMap<String, String> {
        [("src/lexer.rs", "aa"), ("src/net.rs", "bb"), ("src/db.rs", "cc")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn index_with(provider: Arc<StubProvider>, cache: Arc<MemoryVectorCache>) -> EmbeddingIndex {
        EmbeddingIndex::new(provider, cache)
    }

    #[test]
    fn test_empty_index_search_is_empty() {
        let provider = Arc::new(StubProvider::new(32));
        let index = index_with(provider.clone(), Arc::new(MemoryVectorCache::new()));

        assert!(index.search("anything", 5).unwrap().is_empty());
        assert!(index.search_vector(&[1.0; 32], 5).is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn test_search_ranks_matching_chunk_first() {
        let provider = Arc::new(StubProvider::new(64));
        let mut index = index_with(provider, Arc::new(MemoryVectorCache::new()));

        let report = index.index(&sample_chunks(), &fingerprints()).unwrap();
        assert_eq!(report.misses, 3);
        assert_eq!(report.indexed, 3);

        let hits = index.search("socket network", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "c2");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_cached_vectors_skip_provider() {
        let cache = Arc::new(MemoryVectorCache::new());
        let first = Arc::new(StubProvider::new(32));
        index_with(first.clone(), cache.clone())
            .index(&sample_chunks(), &fingerprints())
            .unwrap();
        assert_eq!(first.calls(), 1);

        let second = Arc::new(StubProvider::new(32));
        let mut index = index_with(second.clone(), cache.clone());
        let report = index.index(&sample_chunks(), &fingerprints()).unwrap();

        assert_eq!(report.hits, 3);
        assert_eq!(report.misses, 0);
        assert_eq!(second.calls(), 0);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_changed_file_is_a_miss() {
        let cache = Arc::new(MemoryVectorCache::new());
        let provider = Arc::new(StubProvider::new(32));
        let mut index = index_with(provider.clone(), cache.clone());
        index.index(&sample_chunks(), &fingerprints()).unwrap();

        let mut changed = fingerprints();
        changed.insert("src/net.rs".to_string(), "b2".to_string());
        let report = index.index(&sample_chunks(), &changed).unwrap();

        assert_eq!(report.hits, 2);
        assert_eq!(report.misses, 1);
        assert_eq!(*provider.batches.lock().unwrap().last().unwrap(), 1);
        // Re-indexing the same ids replaces rather than duplicates
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_repeated_id_in_one_call_is_stored_once() {
        let provider = Arc::new(StubProvider::new(8));
        let mut index = index_with(provider, Arc::new(MemoryVectorCache::new()));

        let chunks = vec![
            CodeChunk::new("dup", "src/a.rs", "first", "first body"),
            CodeChunk::new("dup", "src/a.rs", "second", "second body"),
        ];
        let report = index.index(&chunks, &BodyFingerprints).unwrap();

        assert_eq!(report.indexed, 1);
        assert_eq!(index.len(), 1);

        let hits = index.search("second body", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.symbol, "second");
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<String>>,
    }

    impl IndexProgress for RecordingProgress {
        fn begin(&self, total: usize) {
            self.events.lock().unwrap().push(format!("begin {total}"));
        }

        fn advance(&self, done: usize, total: usize) {
            self.events.lock().unwrap().push(format!("advance {done}/{total}"));
        }

        fn finish(&self, failure: Option<&Error>) {
            let outcome = if failure.is_some() { "failed" } else { "ok" };
            self.events.lock().unwrap().push(format!("finish {outcome}"));
        }
    }

    #[test]
    fn test_progress_follows_batches() {
        let progress = Arc::new(RecordingProgress::default());
        let cache = Arc::new(MemoryVectorCache::new());
        let provider = Arc::new(StubProvider::new(16).with_max_batch(2));
        let mut index = index_with(provider, cache.clone()).with_progress(progress.clone());

        let chunks: Vec<CodeChunk> = (0..5)
            .map(|i| CodeChunk::new(format!("c{i}"), "src/a.rs", format!("f{i}"), format!("body {i}")))
            .collect();
        index.index(&chunks, &BodyFingerprints).unwrap();

        assert_eq!(
            *progress.events.lock().unwrap(),
            vec!["begin 5", "advance 2/5", "advance 4/5", "advance 5/5", "finish ok"]
        );

        // Everything cached now: no embedding work, no progress
        index.index(&chunks, &BodyFingerprints).unwrap();
        assert_eq!(progress.events.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_progress_reports_failure() {
        let progress = Arc::new(RecordingProgress::default());
        let provider = Arc::new(StubProvider::new(16).failing());
        let mut index =
            index_with(provider, Arc::new(MemoryVectorCache::new())).with_progress(progress.clone());

        assert!(index.index(&sample_chunks(), &fingerprints()).is_err());
        assert_eq!(*progress.events.lock().unwrap(), vec!["begin 3", "finish failed"]);
    }

    #[test]
    fn test_misses_are_batched() {
        let provider = Arc::new(StubProvider::new(16).with_max_batch(2));
        let mut index = index_with(provider.clone(), Arc::new(MemoryVectorCache::new()));

        let chunks: Vec<CodeChunk> = (0..5)
            .map(|i| CodeChunk::new(format!("c{i}"), "src/a.rs", format!("f{i}"), format!("body {i}")))
            .collect();
        index.index(&chunks, &BodyFingerprints).unwrap();

        assert_eq!(*provider.batches.lock().unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn test_provider_failure_leaves_index_unchanged() {
        let provider = Arc::new(StubProvider::new(16).failing());
        let mut index = index_with(provider, Arc::new(MemoryVectorCache::new()));

        assert!(index.index(&sample_chunks(), &fingerprints()).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_load_preserves_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index").join("vectors.json");
        let provider = Arc::new(StubProvider::new(64));

        let mut index = index_with(provider.clone(), Arc::new(MemoryVectorCache::new()));
        index.index(&sample_chunks(), &fingerprints()).unwrap();
        index.save(&path).unwrap();

        let query = provider.vectorize("parse database tokens");
        let before = index.search_vector(&query, 3);

        let mut reloaded = index_with(provider.clone(), Arc::new(MemoryVectorCache::new()));
        assert_eq!(reloaded.load(&path).unwrap(), 3);
        let after = reloaded.search_vector(&query, 3);

        assert_eq!(before, after);
        assert_eq!(after.iter().find(|h| h.chunk.id == "c3").unwrap().chunk.symbol, "Store.query");
    }

    #[test]
    fn test_load_rejects_other_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");

        let mut big = index_with(Arc::new(StubProvider::new(4096)), Arc::new(MemoryVectorCache::new()));
        big.index(&sample_chunks(), &fingerprints()).unwrap();
        big.save(&path).unwrap();

        let mut small = index_with(Arc::new(StubProvider::new(512)), Arc::new(MemoryVectorCache::new()));
        let err = small.load(&path).unwrap_err();

        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 512,
                found: 4096
            }
        ));
        assert!(small.is_empty());
    }

    #[test]
    fn test_wrong_sized_cached_vector_is_recomputed() {
        let cache = Arc::new(MemoryVectorCache::new());
        cache.put(&CacheKey::new("c1", "aa"), &[1.0, 2.0]).unwrap();

        let provider = Arc::new(StubProvider::new(8));
        let mut index = index_with(provider, cache);
        let report = index.index(&sample_chunks()[..1], &fingerprints()).unwrap();

        assert_eq!(report.misses, 1);
    }

    #[test]
    fn test_clear() {
        let mut index = index_with(Arc::new(StubProvider::new(8)), Arc::new(MemoryVectorCache::new()));
        index.index(&sample_chunks(), &fingerprints()).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert!(index.search("tokens", 3).unwrap().is_empty());
    }
}
