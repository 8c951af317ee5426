use std::path::PathBuf;

use crate::error::AppError;
use crate::retrieval::TurnSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// OpenAI-compatible `/embeddings` endpoint.
    OpenAi,
    /// Local fastembed model.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    LanceDb,
    Memory,
}

/// Application configuration loaded explicitly from environment variables.
///
/// OpenAI client settings (`OPENAI_*`) are read separately by
/// `agent_common::openai::OpenAiClientConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model used for both the relevance filter and the reply.
    pub model: String,
    pub embedding_backend: EmbeddingBackend,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub store_backend: StoreBackend,
    /// Filesystem path to the LanceDB data directory. Required for the LanceDB store.
    pub lancedb_path: Option<String>,
    /// Redis connection URL. `None` disables the embedding cache and seed tracking.
    pub redis_url: Option<String>,
    /// JSON file of guidelines to index at startup and on `reindex_guidelines`.
    pub guidelines_file: Option<PathBuf>,
    /// Number of conditional candidates fetched by similarity search.
    pub match_count: usize,
    pub turn_selection: TurnSelection,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional, with defaults:
    /// - `AGENT_MODEL` (gpt-4o)
    /// - `EMBEDDING_BACKEND`: `openai` | `local` (openai)
    /// - `EMBEDDING_MODEL` (text-embedding-3-small), `EMBEDDING_DIMENSIONS` (1536)
    /// - `GUIDELINE_STORE`: `lancedb` | `memory` (lancedb)
    /// - `CONDITIONAL_MATCH_COUNT` (5)
    /// - `EMBED_TURNS`: `all` | `user` (all)
    ///
    /// Optional, no default: `LANCEDB_PATH` (required when the store is lancedb),
    /// `REDIS_URL`, `GUIDELINES_FILE`.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let embedding_backend = match var("EMBEDDING_BACKEND").as_deref() {
            None | Some("openai") => EmbeddingBackend::OpenAi,
            Some("local") => EmbeddingBackend::Local,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "EMBEDDING_BACKEND must be 'openai' or 'local', got '{other}'"
                )))
            }
        };

        let store_backend = match var("GUIDELINE_STORE").as_deref() {
            None | Some("lancedb") => StoreBackend::LanceDb,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "GUIDELINE_STORE must be 'lancedb' or 'memory', got '{other}'"
                )))
            }
        };

        let lancedb_path = var("LANCEDB_PATH");
        if store_backend == StoreBackend::LanceDb && lancedb_path.is_none() {
            return Err(AppError::Config(
                "LANCEDB_PATH environment variable is required for the lancedb store".to_string(),
            ));
        }

        let guidelines_file = var("GUIDELINES_FILE").map(PathBuf::from);
        if let Some(path) = &guidelines_file {
            if !path.exists() {
                return Err(AppError::Config(format!(
                    "GUIDELINES_FILE not found at {}",
                    path.display()
                )));
            }
        }

        let turn_selection = match var("EMBED_TURNS").as_deref() {
            None | Some("all") => TurnSelection::AllTurns,
            Some("user") => TurnSelection::UserTurns,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "EMBED_TURNS must be 'all' or 'user', got '{other}'"
                )))
            }
        };

        Ok(Self {
            model: var("AGENT_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            embedding_backend,
            embedding_model: var("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embedding_dimensions: parse_positive(var("EMBEDDING_DIMENSIONS"), "EMBEDDING_DIMENSIONS", 1536)?,
            store_backend,
            lancedb_path,
            redis_url: var("REDIS_URL"),
            guidelines_file,
            match_count: parse_positive(var("CONDITIONAL_MATCH_COUNT"), "CONDITIONAL_MATCH_COUNT", 5)?,
            turn_selection,
        })
    }
}

fn parse_positive(value: Option<String>, name: &str, default: usize) -> Result<usize, AppError> {
    let Some(raw) = value else {
        return Ok(default);
    };
    raw.parse::<usize>()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| AppError::Config(format!("{name} must be a positive integer, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, AppError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_with_memory_store() {
        let config = load(&[("GUIDELINE_STORE", "memory")]).unwrap();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.embedding_backend, EmbeddingBackend::OpenAi);
        assert_eq!(config.embedding_dimensions, 1536);
        assert_eq!(config.match_count, 5);
        assert_eq!(config.turn_selection, TurnSelection::AllTurns);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn lancedb_store_requires_path() {
        assert!(matches!(load(&[]), Err(AppError::Config(_))));
        let config = load(&[("LANCEDB_PATH", "/tmp/lance")]).unwrap();
        assert_eq!(config.store_backend, StoreBackend::LanceDb);
        assert_eq!(config.lancedb_path.as_deref(), Some("/tmp/lance"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            vec![("GUIDELINE_STORE", "memory"), ("EMBED_TURNS", "assistant")],
            vec![("GUIDELINE_STORE", "memory"), ("CONDITIONAL_MATCH_COUNT", "0")],
            vec![("GUIDELINE_STORE", "memory"), ("EMBEDDING_BACKEND", "cohere")],
            vec![("GUIDELINE_STORE", "sqlite")],
            vec![("GUIDELINE_STORE", "memory"), ("GUIDELINES_FILE", "/definitely/not/here.json")],
        ] {
            assert!(load(&pairs).is_err(), "expected error for {pairs:?}");
        }
    }

    #[test]
    fn user_turn_selection_is_configurable() {
        let config = load(&[("GUIDELINE_STORE", "memory"), ("EMBED_TURNS", "user")]).unwrap();
        assert_eq!(config.turn_selection, TurnSelection::UserTurns);
    }
}
