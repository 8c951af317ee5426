/// Seed and re-index service for guidelines.
///
/// Reads the JSON seed file, embeds every condition, and replaces the store
/// contents. The file's SHA-256 is remembered in Redis so startup can skip the
/// work when nothing changed. Also embeds conditions for guidelines added one
/// at a time through the management tools.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use agent_common::embedding::{normalize_text, TextEmbedder};
use agent_common::error::CommonError;

use crate::cache::AgentCache;
use crate::error::AppError;
use crate::model::{Guideline, GuidelineId};
use crate::store::GuidelineStore;

/// One entry of the seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct GuidelineSeed {
    pub id: Option<GuidelineId>,
    pub condition: Option<String>,
    pub directive: String,
    /// Defaults to `true` exactly when no condition is given.
    pub is_global: Option<bool>,
    #[serde(default)]
    pub is_disabled: bool,
}

/// Result of an update operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    /// Whether a re-index happened (false if already up to date).
    pub updated: bool,
    /// Number of guidelines in the store afterwards.
    pub guideline_count: usize,
}

pub struct UpdateService {
    guidelines_file: Option<PathBuf>,
    embedder: Arc<dyn TextEmbedder>,
    store: Arc<dyn GuidelineStore>,
    cache: Arc<AgentCache>,
}

impl UpdateService {
    pub fn new(
        guidelines_file: Option<PathBuf>,
        embedder: Arc<dyn TextEmbedder>,
        store: Arc<dyn GuidelineStore>,
        cache: Arc<AgentCache>,
    ) -> Self {
        Self {
            guidelines_file,
            embedder,
            store,
            cache,
        }
    }

    /// Whether the seed file differs from what was last indexed, or the store is empty.
    /// Always `false` when no seed file is configured.
    pub async fn needs_update(&self) -> Result<bool, AppError> {
        let Some(path) = &self.guidelines_file else {
            return Ok(false);
        };
        let current = file_hash(path)?;

        match self.cache.get_seed_hash().await {
            Some(indexed) if indexed == current => {
                if self.count().await? == 0 {
                    info!("guideline store empty, re-index needed");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(true),
        }
    }

    /// Parse, embed and store the seed file, replacing everything in the store.
    pub async fn full_reindex(&self) -> Result<usize, AppError> {
        let path = self
            .guidelines_file
            .as_deref()
            .ok_or_else(|| AppError::Config("GUIDELINES_FILE is not set".to_string()))?;
        let hash = file_hash(path)?;
        info!(file = %path.display(), hash = %hash, "starting full re-index");

        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Seed(format!("failed to read {}: {e}", path.display())))?;
        let seeds = parse_seed_file(&content)?;
        let mut guidelines = build_guidelines(seeds)?;
        self.embed_conditions(&mut guidelines).await?;

        let count = guidelines.len();
        self.store.replace_all(guidelines).await?;
        self.cache.set_seed_hash(&hash).await;

        info!(guidelines = count, "re-index complete");
        Ok(count)
    }

    /// Re-index if needed.
    pub async fn update(&self) -> Result<UpdateResult, AppError> {
        if !self.needs_update().await? {
            info!("guidelines up to date, skipping re-index");
            return Ok(UpdateResult {
                updated: false,
                guideline_count: self.count().await?,
            });
        }
        let guideline_count = self.full_reindex().await?;
        Ok(UpdateResult {
            updated: true,
            guideline_count,
        })
    }

    /// Validate, embed and insert a single new guideline under the next free id.
    pub async fn add_guideline(
        &self,
        directive: String,
        condition: Option<String>,
        is_global: Option<bool>,
    ) -> Result<Guideline, AppError> {
        let id = self.store.next_id().await?;
        let mut guideline = Guideline {
            id,
            is_global: is_global.unwrap_or(condition.is_none()),
            condition,
            directive,
            is_disabled: false,
            condition_vector: None,
        };
        guideline.validate()?;
        self.embed_conditions(std::slice::from_mut(&mut guideline)).await?;
        self.store.insert(guideline.clone()).await?;
        info!(id, is_global = guideline.is_global, "guideline added");
        Ok(guideline)
    }

    async fn count(&self) -> Result<usize, AppError> {
        let globals = self.store.fetch_by_type(true, false).await?;
        let conditionals = self.store.fetch_by_type(false, false).await?;
        Ok(globals.len() + conditionals.len())
    }

    /// Fill in `condition_vector` for every conditional guideline.
    async fn embed_conditions(&self, guidelines: &mut [Guideline]) -> Result<(), AppError> {
        let texts: Vec<String> = guidelines
            .iter()
            .filter_map(|g| g.condition.as_deref())
            .map(normalize_text)
            .collect();
        if texts.is_empty() {
            return Ok(());
        }

        info!("generating embeddings for {} conditions", texts.len());
        let vectors = self.embedder.embed_documents(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(AppError::Common(CommonError::Embedding(format!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                vectors.len()
            ))));
        }

        let mut vectors = vectors.into_iter();
        for g in guidelines.iter_mut().filter(|g| g.condition.is_some()) {
            g.condition_vector = vectors.next();
        }
        Ok(())
    }
}

pub fn parse_seed_file(content: &str) -> Result<Vec<GuidelineSeed>, AppError> {
    serde_json::from_str(content).map_err(|e| AppError::Seed(format!("invalid guidelines JSON: {e}")))
}

/// Turn seed entries into validated guidelines. Entries without an id get
/// sequential ids after the largest explicit one.
pub fn build_guidelines(seeds: Vec<GuidelineSeed>) -> Result<Vec<Guideline>, AppError> {
    let mut next_id = seeds.iter().filter_map(|s| s.id).max().unwrap_or(0) + 1;
    let mut seen = HashSet::new();
    let mut guidelines = Vec::with_capacity(seeds.len());

    for seed in seeds {
        let id = match seed.id {
            Some(id) => id,
            None => {
                next_id += 1;
                next_id - 1
            }
        };
        if !seen.insert(id) {
            return Err(AppError::Seed(format!("duplicate guideline id {id}")));
        }

        let guideline = Guideline {
            id,
            is_global: seed.is_global.unwrap_or(seed.condition.is_none()),
            condition: seed.condition,
            directive: seed.directive,
            is_disabled: seed.is_disabled,
            condition_vector: None,
        };
        guideline.validate()?;
        guidelines.push(guideline);
    }

    let disabled = guidelines.iter().filter(|g| g.is_disabled).count();
    if disabled > 0 {
        warn!(disabled, "seed file contains disabled guidelines");
    }
    Ok(guidelines)
}

fn file_hash(path: &Path) -> Result<String, AppError> {
    let bytes = std::fs::read(path)
        .map_err(|e| AppError::Seed(format!("failed to read {}: {e}", path.display())))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
