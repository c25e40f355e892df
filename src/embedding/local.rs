use super::EmbeddingProvider;
use crate::{Error, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

/// In-process provider backed by a local transformer model.
///
/// Runs synchronously on the calling thread; there is nothing to retry.
pub struct LocalProvider {
    model: TextEmbedding,
    name: String,
    dimensions: usize,
    query_instruction: Option<String>,
}

impl LocalProvider {
    /// Load the default model (all-MiniLM-L6-v2)
    pub fn new(query_instruction: Option<String>) -> Result<Self> {
        Self::with_model(EmbeddingModel::AllMiniLML6V2, "all-MiniLM-L6-v2", query_instruction)
    }

    pub fn with_model(
        model_name: EmbeddingModel,
        label: &str,
        query_instruction: Option<String>,
    ) -> Result<Self> {
        let mut options = InitOptions::default();
        options.model_name = model_name;
        options.show_download_progress = true;

        let model = TextEmbedding::try_new(options)
            .map_err(|e| Error::Provider(format!("Failed to load embedding model: {}", e)))?;

        // Ask the model rather than keeping a table of sizes per model
        let dimensions = model
            .embed(vec!["dimension check"], None)
            .map_err(|e| Error::Provider(format!("Dimension check failed: {}", e)))?
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::Provider("Dimension check returned nothing".to_string()))?;

        tracing::info!("Loaded local embedding model {} ({} dims)", label, dimensions);

        Ok(Self {
            model,
            name: format!("local:{}", label),
            dimensions,
            query_instruction,
        })
    }
}

/// Apply the query instruction, if any, to query texts only.
fn prepare_inputs(texts: &[String], is_query: bool, instruction: Option<&str>) -> Vec<String> {
    match instruction {
        Some(prefix) if is_query => texts.iter().map(|t| format!("{}{}", prefix, t)).collect(),
        _ => texts.to_vec(),
    }
}

impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let inputs = prepare_inputs(texts, is_query, self.query_instruction.as_deref());
        self.model
            .embed(inputs, None)
            .map_err(|e| Error::Provider(format!("Embedding generation failed: {}", e)))
    }
}
