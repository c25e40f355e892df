//! Semantic embedding index and embedding providers
//!
//! Providers turn text into fixed-length vectors. The index keeps one vector
//! per chunk, reuses cached vectors for unchanged files and ranks chunks by
//! cosine similarity.

pub mod index;
pub mod local;
pub mod remote;

pub use index::{BodyFingerprints, EmbeddingIndex, FingerprintSource, IndexProgress, IndexReport, SearchHit};
pub use local::LocalProvider;
pub use remote::{
    Capabilities, EmbedTransport, HttpTransport, JobReporter, JobTicket, RemoteProvider, RetryPolicy,
};

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::{Error, Result};
use std::sync::Arc;

/// Largest batch the embedding service accepts in one request
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// Trait for pluggable embedding providers.
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name, recorded in saved indexes
    fn name(&self) -> &str;

    /// Length of every vector this provider returns
    fn dimensions(&self) -> usize;

    /// Most texts a single `embed` call should carry
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    /// Embed a batch, one vector per input in order.
    ///
    /// `is_query` marks search queries, for models that embed queries and
    /// documents with different instructions.
    fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>>;
}

/// Cosine similarity; 0 when either vector has zero norm or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Build the provider described by `config`.
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        ProviderKind::Local => Ok(Arc::new(LocalProvider::new(
            config.query_instruction.clone(),
        )?)),
        ProviderKind::Remote => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                Error::Config("embedding.endpoint is required for the remote provider".to_string())
            })?;
            Ok(Arc::new(RemoteProvider::from_config(endpoint, config)?))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_is_one() {
        let v = [0.3, -1.2, 4.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        let v = [0.3, -1.2, 4.0];
        assert_eq!(cosine_similarity(&v, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &v), 0.0);
    }

    #[test]
    fn test_cosine_orthogonal_opposite_and_mismatched() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_remote_provider_requires_endpoint() {
        let config = EmbeddingConfig {
            provider: ProviderKind::Remote,
            endpoint: None,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(provider_from_config(&config), Err(Error::Config(_))));
    }
}
