/// The guideline agent: retrieval, relevance filtering, prompt assembly and
/// generation, run once per incoming conversation.
///
/// `process_message` is the only public boundary. Stages contain their own
/// failures; anything that still escapes (an error or a panic) becomes a fixed
/// apology here.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info};

use agent_common::embedding::TextEmbedder;

use crate::error::AppError;
use crate::filter::RelevanceFilter;
use crate::generator::ResponseGenerator;
use crate::llm::{Decoding, LanguageModel};
use crate::model::{AgentResponse, ConversationTurn};
use crate::prompt;
use crate::retrieval::{RetrievalStage, TurnSelection};
use crate::store::GuidelineStore;

pub const PIPELINE_APOLOGY: &str =
    "I apologize, but I encountered an error while processing your message. Please try again.";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    /// Top-k for semantic retrieval.
    pub match_count: usize,
    pub turn_selection: TurnSelection,
    pub decoding: Decoding,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            match_count: 5,
            turn_selection: TurnSelection::AllTurns,
            decoding: Decoding::default(),
        }
    }
}

#[derive(Clone)]
pub struct GuidelineAgent {
    retrieval: Arc<RetrievalStage>,
    filter: Arc<RelevanceFilter>,
    generator: Arc<ResponseGenerator>,
    match_count: usize,
}

impl GuidelineAgent {
    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        store: Arc<dyn GuidelineStore>,
        llm: Arc<dyn LanguageModel>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            retrieval: Arc::new(RetrievalStage::new(embedder, store, settings.turn_selection)),
            filter: Arc::new(RelevanceFilter::new(
                llm.clone(),
                settings.model.clone(),
                settings.decoding,
            )),
            generator: Arc::new(ResponseGenerator::new(llm, settings.model, settings.decoding)),
            match_count: settings.match_count,
        }
    }

    /// Produce a reply for `conversation`. Always returns a non-empty message.
    pub async fn process_message(&self, conversation: &[ConversationTurn]) -> AgentResponse {
        let outcome = AssertUnwindSafe(self.run(conversation)).catch_unwind().await;
        let message = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(error = %e, "pipeline failed");
                PIPELINE_APOLOGY.to_string()
            }
            Err(_) => {
                error!("pipeline panicked");
                PIPELINE_APOLOGY.to_string()
            }
        };
        AgentResponse { message }
    }

    async fn run(&self, conversation: &[ConversationTurn]) -> Result<String, AppError> {
        if conversation.is_empty() {
            return Err(AppError::EmptyConversation);
        }
        info!(turns = conversation.len(), "processing message");

        let (global, candidates) = tokio::join!(
            self.retrieval.fetch_global_guidelines(),
            self.retrieval.semantic_retrieve(conversation, self.match_count),
        );

        let selected = self.filter.select(candidates, conversation).await;
        let instructions = prompt::assemble(&global, &selected);
        info!(
            global = global.len(),
            conditional = selected.len(),
            "instructions assembled"
        );

        Ok(self.generator.generate(instructions, conversation).await)
    }
}
