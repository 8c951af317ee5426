/// Retrieval stage: global guidelines plus the nearest conditional candidates.
///
/// Both fetches contain their own failures. A store or embedding error is logged
/// and yields an empty list so the rest of the pipeline still runs.
use std::sync::Arc;

use tracing::{debug, info, warn};

use agent_common::embedding::{normalize_text, TextEmbedder};

use crate::error::AppError;
use crate::model::{Candidate, ConversationTurn, Guideline, Role};
use crate::store::GuidelineStore;

/// Which conversation turns feed the similarity query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnSelection {
    /// Every turn, user and assistant.
    #[default]
    AllTurns,
    /// Only the user's turns.
    UserTurns,
}

impl TurnSelection {
    fn includes(self, role: Role) -> bool {
        match self {
            TurnSelection::AllTurns => true,
            TurnSelection::UserTurns => role == Role::User,
        }
    }
}

/// Join the selected turns as `"<role> says <content>"` in conversation order.
pub fn build_query(conversation: &[ConversationTurn], selection: TurnSelection) -> String {
    conversation
        .iter()
        .filter(|turn| selection.includes(turn.role))
        .map(|turn| format!("{} says {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct RetrievalStage {
    embedder: Arc<dyn TextEmbedder>,
    store: Arc<dyn GuidelineStore>,
    selection: TurnSelection,
}

impl RetrievalStage {
    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        store: Arc<dyn GuidelineStore>,
        selection: TurnSelection,
    ) -> Self {
        Self {
            embedder,
            store,
            selection,
        }
    }

    /// All enabled global guidelines, in store order.
    pub async fn fetch_global_guidelines(&self) -> Vec<Guideline> {
        match self.store.fetch_by_type(true, true).await {
            Ok(guidelines) => {
                debug!(count = guidelines.len(), "global guidelines fetched");
                guidelines
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch global guidelines, continuing without them");
                Vec::new()
            }
        }
    }

    /// Top-`k` enabled conditional guidelines nearest to the conversation, most similar first.
    pub async fn semantic_retrieve(&self, conversation: &[ConversationTurn], k: usize) -> Vec<Candidate> {
        match self.try_semantic_retrieve(conversation, k).await {
            Ok(candidates) => {
                info!(candidates = candidates.len(), "semantic retrieval complete");
                for c in &candidates {
                    debug!(
                        id = c.id(),
                        similarity = %format!("{:.2}", c.similarity),
                        directive = c.directive(),
                        "candidate"
                    );
                }
                candidates
            }
            Err(e) => {
                warn!(error = %e, "semantic retrieval failed, continuing with no conditional guidelines");
                Vec::new()
            }
        }
    }

    async fn try_semantic_retrieve(
        &self,
        conversation: &[ConversationTurn],
        k: usize,
    ) -> Result<Vec<Candidate>, AppError> {
        let query = normalize_text(&build_query(conversation, self.selection));
        let vector = self.embedder.embed_query(&query).await?;
        self.store.similarity_search(&vector, k).await
    }
}
