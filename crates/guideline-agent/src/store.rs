/// Guideline storage seam and the in-memory implementation.
///
/// The pipeline only ever calls the two read operations (`fetch_by_type`,
/// `similarity_search`). The write operations back the management tools and the
/// seed/re-index service.
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::model::{Candidate, Guideline, GuidelineId};

#[async_trait]
pub trait GuidelineStore: Send + Sync {
    /// Guidelines of one kind in stable store order. `enabled_only` drops disabled rows.
    async fn fetch_by_type(&self, is_global: bool, enabled_only: bool) -> Result<Vec<Guideline>, AppError>;

    /// Up to `k` enabled conditional guidelines, most similar first (cosine).
    async fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<Candidate>, AppError>;

    async fn insert(&self, guideline: Guideline) -> Result<(), AppError>;

    /// Replace the entire contents of the store.
    async fn replace_all(&self, guidelines: Vec<Guideline>) -> Result<(), AppError>;

    async fn set_disabled(&self, id: GuidelineId, disabled: bool) -> Result<(), AppError>;

    /// Remove a guideline permanently. `NotFound` if no row has this id.
    async fn delete(&self, id: GuidelineId) -> Result<(), AppError>;

    /// One past the largest id currently stored (1 for an empty store).
    async fn next_id(&self) -> Result<GuidelineId, AppError> {
        let mut all = self.fetch_by_type(true, false).await?;
        all.extend(self.fetch_by_type(false, false).await?);
        Ok(all.iter().map(|g| g.id).max().unwrap_or(0) + 1)
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]. Returns 0.0 for mismatched lengths, empty or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Process-local store. Rows keep insertion order.
#[derive(Default)]
pub struct MemoryGuidelineStore {
    rows: RwLock<Vec<Guideline>>,
}

impl MemoryGuidelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guidelines(guidelines: Vec<Guideline>) -> Result<Self, AppError> {
        for g in &guidelines {
            g.validate()?;
        }
        Ok(Self {
            rows: RwLock::new(guidelines),
        })
    }
}

#[async_trait]
impl GuidelineStore for MemoryGuidelineStore {
    async fn fetch_by_type(&self, is_global: bool, enabled_only: bool) -> Result<Vec<Guideline>, AppError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|g| g.is_global == is_global && !(enabled_only && g.is_disabled))
            .cloned()
            .collect())
    }

    async fn similarity_search(&self, query: &[f32], k: usize) -> Result<Vec<Candidate>, AppError> {
        let rows = self.rows.read().await;
        let mut scored: Vec<Candidate> = rows
            .iter()
            .filter(|g| !g.is_global && !g.is_disabled)
            .filter_map(|g| {
                let vector = g.condition_vector.as_ref()?;
                Some(Candidate {
                    guideline: g.clone(),
                    similarity: cosine_similarity(vector, query),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        Ok(scored)
    }

    async fn insert(&self, guideline: Guideline) -> Result<(), AppError> {
        guideline.validate()?;
        let mut rows = self.rows.write().await;
        if rows.iter().any(|g| g.id == guideline.id) {
            return Err(AppError::InvalidGuideline {
                id: guideline.id,
                reason: "id already exists".to_string(),
            });
        }
        rows.push(guideline);
        Ok(())
    }

    async fn replace_all(&self, guidelines: Vec<Guideline>) -> Result<(), AppError> {
        for g in &guidelines {
            g.validate()?;
        }
        *self.rows.write().await = guidelines;
        Ok(())
    }

    async fn set_disabled(&self, id: GuidelineId, disabled: bool) -> Result<(), AppError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or(AppError::NotFound(id))?;
        row.is_disabled = disabled;
        Ok(())
    }

    async fn delete(&self, id: GuidelineId) -> Result<(), AppError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|g| g.id != id);
        if rows.len() == before {
            return Err(AppError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryGuidelineStore {
        MemoryGuidelineStore::with_guidelines(vec![
            Guideline::global(1, "Be polite"),
            Guideline::global(2, "Never share internal notes").disabled(),
            Guideline::conditional(3, "refund request", "Offer a discount", Some(vec![1.0, 0.0])),
            Guideline::conditional(4, "shipping delay", "Apologize for the delay", Some(vec![0.0, 1.0])),
            Guideline::conditional(5, "refund request again", "Escalate", Some(vec![0.9, 0.1])).disabled(),
            Guideline::conditional(6, "greeting", "Say hello", Some(vec![0.7, 0.7])),
        ])
        .unwrap()
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn fetch_by_type_respects_enabled_filter() {
        let store = sample();
        let enabled: Vec<_> = store.fetch_by_type(true, true).await.unwrap().iter().map(|g| g.id).collect();
        assert_eq!(enabled, vec![1]);
        let all: Vec<_> = store.fetch_by_type(true, false).await.unwrap().iter().map(|g| g.id).collect();
        assert_eq!(all, vec![1, 2]);
        let conditional = store.fetch_by_type(false, true).await.unwrap();
        assert!(conditional.iter().all(|g| !g.is_global && !g.is_disabled));
    }

    #[tokio::test]
    async fn similarity_search_ranks_enabled_conditionals() {
        let store = sample();
        let results = store.similarity_search(&[1.0, 0.0], 2).await.unwrap();
        let ids: Vec<_> = results.iter().map(Candidate::id).collect();
        // 5 is closer than 6 but disabled.
        assert_eq!(ids, vec![3, 6]);
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[tokio::test]
    async fn set_disabled_hides_from_search() {
        let store = sample();
        store.set_disabled(3, true).await.unwrap();
        let ids: Vec<_> = store
            .similarity_search(&[1.0, 0.0], 5)
            .await
            .unwrap()
            .iter()
            .map(Candidate::id)
            .collect();
        assert!(!ids.contains(&3));
        assert!(matches!(store.set_disabled(99, true).await, Err(AppError::NotFound(99))));
    }

    #[tokio::test]
    async fn insert_validates_and_assigns_ids() {
        let store = sample();
        assert_eq!(store.next_id().await.unwrap(), 7);
        store.insert(Guideline::global(7, "Sign off with the company name")).await.unwrap();
        assert!(store.insert(Guideline::global(7, "duplicate")).await.is_err());
        let mut bad = Guideline::global(8, "Be brief");
        bad.condition = Some("long answers".to_string());
        assert!(store.insert(bad).await.is_err());
        assert_eq!(MemoryGuidelineStore::new().next_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let store = sample();
        store.delete(3).await.unwrap();
        let ids: Vec<_> = store
            .similarity_search(&[1.0, 0.0], 5)
            .await
            .unwrap()
            .iter()
            .map(Candidate::id)
            .collect();
        assert_eq!(ids, vec![6, 4]);
        assert!(matches!(store.delete(3).await, Err(AppError::NotFound(3))));
        assert_eq!(store.fetch_by_type(false, false).await.unwrap().len(), 3);
    }
}
