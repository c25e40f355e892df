//! # Cartographer - incremental code intelligence index
//!
//! Lets many cheap analyses run repeatedly over a large, changing source tree.
//!
//! Cartographer provides:
//! - A source snapshot store with fingerprint-based change detection and
//!   syntax trees built at most once per file
//! - A debounced filesystem watcher that keeps the snapshot current
//! - A call graph over extracted chunks with traversal and path queries
//! - A semantic embedding index with cached vectors, local or remote
//!   embedding providers, and single-file persistence

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod graph;
pub mod ignore;
pub mod source;
pub mod storage;
pub mod watcher;

// Re-exports for convenient access
pub use chunk::{ChunkMeta, CodeChunk};
pub use config::Config;
pub use embedding::{EmbeddingIndex, EmbeddingProvider};
pub use graph::CallGraph;
pub use source::{SnapshotStore, SourceUnit};
pub use watcher::ChangeWatcher;

/// Result type alias for Cartographer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Cartographer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Embedding provider error: {0}")]
    Provider(String),

    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}
