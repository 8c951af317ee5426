/// Embedding backends behind a common `TextEmbedder` trait.
///
/// Two implementations are provided:
/// - `OpenAiEmbedder`: calls an OpenAI-compatible `/embeddings` endpoint.
/// - `LocalEmbedder`: runs fastembed (nomic-embed-text-v1.5) on blocking threads.
///
/// Callers normalize input with [`normalize_text`] before embedding. Both backends
/// reject input that is empty after trimming.
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CommonError;
use crate::openai::{EmbeddingRequest, OpenAiClient};

/// Trim, collapse internal whitespace runs to a single space, and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Converts text into fixed-dimension vectors for similarity comparison.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Stable identifier of the underlying model, used for cache keys.
    fn model_id(&self) -> &str;

    /// Dimensionality of every vector this embedder produces.
    fn dimensions(&self) -> usize;

    /// Embed a single search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CommonError>;

    /// Embed documents for indexing. Output order matches input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError>;
}

fn ensure_not_empty(text: &str) -> Result<(), CommonError> {
    if text.trim().is_empty() {
        return Err(CommonError::Embedding("text input cannot be empty".to_string()));
    }
    Ok(())
}

// --- OpenAI-compatible embeddings ---

pub struct OpenAiEmbedder {
    client: Arc<OpenAiClient>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(client: Arc<OpenAiClient>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
        }
    }

    async fn embed_batch(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, CommonError> {
        let expected = inputs.len();
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: inputs,
            dimensions: Some(self.dimensions as u32),
        };
        let mut response = self
            .client
            .embeddings(request)
            .await
            .map_err(|e| CommonError::Embedding(format!("embedding request failed: {e}")))?;

        if response.data.len() != expected {
            return Err(CommonError::Embedding(format!(
                "embedding count mismatch: expected {expected}, got {}",
                response.data.len()
            )));
        }

        // The API tags each vector with its input index; don't rely on response order.
        response.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = response.data.into_iter().map(|d| d.embedding).collect();

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(CommonError::Embedding(format!(
                "unexpected embedding dimension: expected {}, got {}",
                self.dimensions,
                bad.len()
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl TextEmbedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CommonError> {
        ensure_not_empty(text)?;
        self.embed_batch(vec![text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| CommonError::Embedding("empty embedding result".to_string()))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for text in texts {
            ensure_not_empty(text)?;
        }
        self.embed_batch(texts.to_vec()).await
    }
}

// --- Local fastembed model ---

/// Wraps fastembed's `TextEmbedding` model for generating vector embeddings locally.
///
/// `TextEmbedding` is synchronous and CPU-bound, so every call goes through
/// `tokio::task::spawn_blocking`. The nomic-embed-text-v1.5 model uses task-prefixed inputs:
/// - Documents: "search_document: {text}"
/// - Queries: "search_query: {text}"
pub struct LocalEmbedder {
    model: Arc<fastembed::TextEmbedding>,
}

impl LocalEmbedder {
    /// Initialize the embedding model (nomic-embed-text-v1.5).
    ///
    /// This downloads the model on first run (~300MB).
    pub async fn new() -> Result<Self, CommonError> {
        let model = tokio::task::spawn_blocking(|| {
            let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::NomicEmbedTextV15)
                .with_show_download_progress(true);
            fastembed::TextEmbedding::try_new(options)
        })
        .await
        .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| CommonError::Embedding(format!("model initialization failed: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl TextEmbedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        "nomic-embed-text-v1.5"
    }

    fn dimensions(&self) -> usize {
        768
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CommonError> {
        ensure_not_empty(text)?;
        let prefixed = vec![format!("search_query: {text}")];
        let model = Arc::clone(&self.model);
        let mut results = tokio::task::spawn_blocking(move || model.embed(prefixed, None))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("query embedding failed: {e}")))?;
        results
            .pop()
            .ok_or_else(|| CommonError::Embedding("empty embedding result".to_string()))
    }

    /// Documents are processed in small batches to bound peak memory during ONNX inference.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        for text in texts {
            ensure_not_empty(text)?;
        }
        let prefixed: Vec<String> = texts
            .iter()
            .map(|t| format!("search_document: {t}"))
            .collect();
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(prefixed, Some(4)))
            .await
            .map_err(|e| CommonError::Embedding(format!("spawn_blocking join error: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("document embedding failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_lowercases() {
        assert_eq!(
            normalize_text("  User says   I WANT\ta\n\nRefund  "),
            "user says i want a refund"
        );
    }

    #[test]
    fn normalize_of_blank_is_empty() {
        assert_eq!(normalize_text(" \t\n "), "");
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = ensure_not_empty("   ").unwrap_err();
        assert!(matches!(err, CommonError::Embedding(_)));
        assert!(ensure_not_empty("refund").is_ok());
    }
}
