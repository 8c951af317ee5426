/// Response generator: the final model call, with every failure mapped to a
/// fixed apology so the caller always has something to show the user.
use std::sync::Arc;

use tracing::{error, info, warn};

use agent_common::openai::{ChatCompletionRequest, Message};

use crate::llm::{CompletionError, Decoding, LanguageModel};
use crate::model::ConversationTurn;

pub const CONFIGURATION_APOLOGY: &str =
    "I apologize, but the AI service is not properly configured. Please contact support.";
pub const RATE_LIMIT_APOLOGY: &str =
    "I'm experiencing high demand right now. Please try again in a moment.";
pub const CONNECTIVITY_APOLOGY: &str = "I'm having connectivity issues. Please try again shortly.";
pub const GENERIC_APOLOGY: &str =
    "I apologize, but I'm having trouble processing your request right now. Please try again in a moment.";

/// The apology shown for a failed completion.
pub fn apology_for(err: &CompletionError) -> &'static str {
    match err {
        CompletionError::Configuration(_) => CONFIGURATION_APOLOGY,
        CompletionError::RateLimited(_) => RATE_LIMIT_APOLOGY,
        CompletionError::Connectivity(_) => CONNECTIVITY_APOLOGY,
        CompletionError::Other(_) => GENERIC_APOLOGY,
    }
}

pub struct ResponseGenerator {
    llm: Arc<dyn LanguageModel>,
    model: String,
    decoding: Decoding,
}

impl ResponseGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, model: impl Into<String>, decoding: Decoding) -> Self {
        Self {
            llm,
            model: model.into(),
            decoding,
        }
    }

    /// Generate the reply to `conversation` under `instructions`. Never fails.
    pub async fn generate(&self, instructions: String, conversation: &[ConversationTurn]) -> String {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(Message::system(instructions));
        messages.extend(conversation.iter().map(|turn| Message {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        }));

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(self.decoding.temperature),
            top_p: Some(self.decoding.top_p),
            max_tokens: Some(self.decoding.max_tokens),
            response_format: None,
        };

        match self.llm.complete(request).await {
            Ok(text) => {
                let reply = text.trim();
                if reply.is_empty() {
                    warn!("model returned an empty reply");
                    return GENERIC_APOLOGY.to_string();
                }
                info!(chars = reply.len(), "response generated");
                reply.to_string()
            }
            Err(e) => {
                error!(error = %e, "response generation failed");
                apology_for(&e).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    fn conversation() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user("Hi"),
            ConversationTurn::assistant("Hello! How can I help?"),
            ConversationTurn::user("I want a refund"),
        ]
    }

    async fn generate_with(outcome: Result<String, CompletionError>) -> String {
        let model = Arc::new(ScriptedModel::new(vec![outcome]));
        ResponseGenerator::new(model, "gpt-4o", Decoding::default())
            .generate("Be polite".to_string(), &conversation())
            .await
    }

    #[tokio::test]
    async fn instructions_lead_the_conversation() {
        let model = Arc::new(ScriptedModel::replies(&["  Sure, let me help.  \n"]));
        let generator = ResponseGenerator::new(model.clone(), "gpt-4o", Decoding::default());
        let reply = generator.generate("Be polite".to_string(), &conversation()).await;
        assert_eq!(reply, "Sure, let me help.");

        let requests = model.requests();
        let request = &requests[0];
        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(request.messages[0].content, "Be polite");
        assert_eq!(request.messages[3].content, "I want a refund");
        assert_eq!(request.max_tokens, Some(1000));
        assert_eq!(request.response_format, None);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_its_apology() {
        let reply = generate_with(Err(CompletionError::RateLimited("429".to_string()))).await;
        assert_eq!(reply, RATE_LIMIT_APOLOGY);
    }

    #[tokio::test]
    async fn each_failure_has_a_distinct_apology() {
        assert_eq!(
            generate_with(Err(CompletionError::Configuration("401".to_string()))).await,
            CONFIGURATION_APOLOGY
        );
        assert_eq!(
            generate_with(Err(CompletionError::Connectivity("timeout".to_string()))).await,
            CONNECTIVITY_APOLOGY
        );
        assert_eq!(
            generate_with(Err(CompletionError::Other("boom".to_string()))).await,
            GENERIC_APOLOGY
        );
    }

    #[tokio::test]
    async fn blank_reply_is_a_failure() {
        assert_eq!(generate_with(Ok("   \n".to_string())).await, GENERIC_APOLOGY);
    }
}
