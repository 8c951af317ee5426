/// Redis caching layer for the guideline agent.
///
/// All operations degrade gracefully: if Redis is unavailable, reads miss and
/// writes are dropped.
///
/// Key schema (namespaced to avoid collisions):
/// - `gla:v1:embedding:{sha256(model|dimensions|kind|text)}` : JSON Vec<f32> (TTL: 1 day)
/// - `gla:v1:seed_hash` : SHA-256 of the last indexed guidelines file (no TTL)
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use agent_common::embedding::TextEmbedder;
use agent_common::error::CommonError;
use agent_common::redis::RedisCache;

const KEY_PREFIX: &str = "gla:v1:";
const EMBEDDING_TTL_SECS: u64 = 86_400;

pub struct AgentCache {
    redis: RedisCache,
}

impl AgentCache {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    // --- Embeddings ---

    pub async fn get_embedding(&self, space: EmbeddingSpace<'_>, kind: &str, text: &str) -> Option<Vec<f32>> {
        self.redis.get_json(&embedding_key(space, kind, text)).await
    }

    pub async fn set_embedding(&self, space: EmbeddingSpace<'_>, kind: &str, text: &str, vector: &[f32]) {
        self.redis
            .set_json_with_ttl(&embedding_key(space, kind, text), &vector, EMBEDDING_TTL_SECS)
            .await;
    }

    // --- Seed tracking ---

    pub async fn get_seed_hash(&self) -> Option<String> {
        self.redis.get(&format!("{KEY_PREFIX}seed_hash")).await
    }

    pub async fn set_seed_hash(&self, hash: &str) {
        self.redis.set(&format!("{KEY_PREFIX}seed_hash"), hash).await;
    }
}

/// Model and output size of an embedder. The same model id can produce vectors of
/// different sizes, so both go into the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingSpace<'a> {
    pub model: &'a str,
    pub dimensions: usize,
}

impl<'a> EmbeddingSpace<'a> {
    pub fn of(embedder: &'a dyn TextEmbedder) -> Self {
        Self {
            model: embedder.model_id(),
            dimensions: embedder.dimensions(),
        }
    }
}

/// Compute a deterministic cache key for an embedding using SHA-256.
fn embedding_key(space: EmbeddingSpace<'_>, kind: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(space.model.as_bytes());
    hasher.update(b"|");
    hasher.update(space.dimensions.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    format!("{KEY_PREFIX}embedding:{:x}", hasher.finalize())
}

/// Memoizes another embedder's vectors in Redis.
pub struct CachedEmbedder {
    inner: Arc<dyn TextEmbedder>,
    cache: Arc<AgentCache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn TextEmbedder>, cache: Arc<AgentCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl TextEmbedder for CachedEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CommonError> {
        let space = EmbeddingSpace::of(self.inner.as_ref());
        if let Some(hit) = self.cache.get_embedding(space, "query", text).await {
            debug!("query embedding cache hit");
            return Ok(hit);
        }
        let vector = self.inner.embed_query(text).await?;
        self.cache.set_embedding(space, "query", text, &vector).await;
        Ok(vector)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        let space = EmbeddingSpace::of(self.inner.as_ref());
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.cache.get_embedding(space, "document", text).await);
        }

        let missing: Vec<String> = texts
            .iter()
            .zip(&vectors)
            .filter(|(_, v)| v.is_none())
            .map(|(t, _)| t.clone())
            .collect();
        debug!(
            total = texts.len(),
            misses = missing.len(),
            "document embedding cache lookup"
        );

        let mut fresh = if missing.is_empty() {
            Vec::new().into_iter()
        } else {
            self.inner.embed_documents(&missing).await?.into_iter()
        };
        let mut out = Vec::with_capacity(texts.len());
        for (text, cached) in texts.iter().zip(vectors) {
            let vector = match cached {
                Some(v) => v,
                None => {
                    let v = fresh.next().ok_or_else(|| {
                        CommonError::Embedding("embedding count mismatch".to_string())
                    })?;
                    self.cache.set_embedding(space, "document", text, &v).await;
                    v
                }
            };
            out.push(vector);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KeywordEmbedder;

    fn space(model: &str, dimensions: usize) -> EmbeddingSpace<'_> {
        EmbeddingSpace { model, dimensions }
    }

    #[test]
    fn embedding_keys_are_deterministic_and_namespaced() {
        let a = embedding_key(space("m", 1536), "query", "user says hi");
        assert_eq!(a, embedding_key(space("m", 1536), "query", "user says hi"));
        assert_ne!(a, embedding_key(space("m", 1536), "document", "user says hi"));
        assert_ne!(a, embedding_key(space("other", 1536), "query", "user says hi"));
        assert!(a.starts_with("gla:v1:embedding:"));
    }

    #[test]
    fn embedding_keys_separate_output_sizes() {
        let full = embedding_key(space("text-embedding-3-small", 1536), "query", "refund");
        let reduced = embedding_key(space("text-embedding-3-small", 512), "query", "refund");
        assert_ne!(full, reduced);
    }

    #[test]
    fn embedding_space_reads_the_embedder() {
        let embedder = KeywordEmbedder::new(&["refund", "shipping", "greeting"]);
        let space = EmbeddingSpace::of(&embedder);
        assert_eq!(space.model, embedder.model_id());
        assert_eq!(space.dimensions, 3);
    }

    #[tokio::test]
    async fn passes_through_without_redis() {
        let inner = Arc::new(KeywordEmbedder::new(&["refund", "shipping"]));
        let cached = CachedEmbedder::new(
            inner.clone(),
            Arc::new(AgentCache::new(RedisCache::disabled())),
        );
        assert_eq!(cached.dimensions(), 2);
        assert_eq!(cached.embed_query("refund please").await.unwrap(), vec![1.0, 0.0]);
        let docs = cached
            .embed_documents(&["shipping".to_string(), "refund".to_string()])
            .await
            .unwrap();
        assert_eq!(docs, vec![vec![0.0, 1.0], vec![1.0, 0.0]]);
        assert_eq!(inner.calls(), 2);
    }
}
