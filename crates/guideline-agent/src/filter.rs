/// Relevance filter: one structured model call decides which candidates apply.
///
/// The model sees every candidate (id, condition, directive, similarity) and the
/// transcript, and answers with `{"guidelines": [{"id": .., "reason": ".."}]}`.
/// Any failure to obtain or parse that answer fails open: the candidates pass
/// through untouched.
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use agent_common::openai::{ChatCompletionRequest, Message, ResponseFormat};

use crate::llm::{Decoding, LanguageModel};
use crate::model::{AdjudicationResult, Candidate, ConversationTurn, GuidelineId};

/// Outcome of parsing the model's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Adjudication {
    /// Well-formed answer naming the accepted candidates.
    Verdict(AdjudicationResult),
    /// No usable answer; carries the cause. Applying it keeps every candidate.
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    guidelines: Vec<VerdictEntry>,
}

#[derive(Debug, Deserialize)]
struct VerdictEntry {
    id: serde_json::Value,
    #[serde(default)]
    reason: String,
}

impl Adjudication {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Adjudication::Invalid("empty response".to_string());
        }
        let payload: VerdictPayload = match serde_json::from_str(raw) {
            Ok(p) => p,
            Err(e) => return Adjudication::Invalid(format!("malformed verdict: {e}")),
        };

        let mut result = AdjudicationResult::default();
        for entry in payload.guidelines {
            match parse_id(&entry.id) {
                Some(id) => result.insert(id, entry.reason),
                None => debug!(id = %entry.id, "ignoring verdict entry with unusable id"),
            }
        }
        Adjudication::Verdict(result)
    }

    /// Keep the candidates the verdict accepts, in their original order. Ids the
    /// verdict names that match no candidate are ignored.
    pub fn apply(self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        match self {
            Adjudication::Verdict(result) => candidates
                .into_iter()
                .filter(|c| result.accepts(c.id()))
                .collect(),
            Adjudication::Invalid(_) => candidates,
        }
    }
}

/// Ids may come back as JSON numbers or numeric strings.
fn parse_id(value: &serde_json::Value) -> Option<GuidelineId> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct RelevanceFilter {
    llm: Arc<dyn LanguageModel>,
    model: String,
    decoding: Decoding,
}

impl RelevanceFilter {
    pub fn new(llm: Arc<dyn LanguageModel>, model: impl Into<String>, decoding: Decoding) -> Self {
        Self {
            llm,
            model: model.into(),
            decoding,
        }
    }

    /// Return the subset of `candidates` judged to apply right now.
    ///
    /// No model call is made for an empty candidate list.
    pub async fn select(&self, candidates: Vec<Candidate>, conversation: &[ConversationTurn]) -> Vec<Candidate> {
        if candidates.is_empty() {
            return candidates;
        }

        let before = candidates.len();
        let adjudication = self.adjudicate(&candidates, conversation).await;
        if let Adjudication::Invalid(cause) = &adjudication {
            warn!(cause = %cause, candidates = before, "relevance filter failed open");
        }
        let selected = adjudication.apply(candidates);
        info!(before, after = selected.len(), "relevance filter applied");
        selected
    }

    async fn adjudicate(&self, candidates: &[Candidate], conversation: &[ConversationTurn]) -> Adjudication {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::system(filter_prompt(candidates, conversation))],
            temperature: Some(self.decoding.temperature),
            top_p: Some(self.decoding.top_p),
            max_tokens: Some(self.decoding.max_tokens),
            response_format: Some(ResponseFormat::JsonObject),
        };

        let adjudication = match self.llm.complete(request).await {
            Ok(raw) => Adjudication::parse(&raw),
            Err(e) => Adjudication::Invalid(format!("filter call failed: {e}")),
        };
        if let Adjudication::Verdict(result) = &adjudication {
            if result.is_empty() {
                debug!("model accepted no candidates");
            } else {
                debug!(accepted = result.len(), "model verdict parsed");
            }
            for c in candidates {
                if let Some(reason) = result.reason(c.id()) {
                    debug!(id = c.id(), reason, "guideline selected by model");
                }
            }
        }
        adjudication
    }
}

/// Instructions for the adjudication call, with candidates and transcript inlined.
pub fn filter_prompt(candidates: &[Candidate], conversation: &[ConversationTurn]) -> String {
    let candidate_block = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. ID: {}\n   When: \"{}\"\n   Then: \"{}\"\n   Similarity: {:.2}",
                i + 1,
                c.id(),
                c.condition(),
                c.directive(),
                c.similarity
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let transcript = conversation
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You review conditional guidelines for a customer service assistant and decide which of them should be applied to its next reply.

<selection_rules>
1. Relevance: keep a guideline only if its condition clearly matches where the customer is right now.
2. Appropriateness: drop guidelines that would be out of place given the conversation.
3. No repetition: drop guidelines whose action an earlier assistant reply already carried out. Exception: the condition has been triggered again, for a new reason, in the latest user message, and the action has not yet been taken for that new occurrence.
4. Timing: keep a guideline only if it fits the current stage of the conversation.
</selection_rules>

<conditional_guidelines>
{candidate_block}
</conditional_guidelines>

<conversation>
The transcript shows what the customer said and how the assistant already answered. Check it for guidelines that were already applied.
{transcript}
</conversation>

<response_format>
Answer with a JSON object listing only the guidelines that pass every rule above:
{{
  "guidelines": [
    {{ "id": <guideline id>, "reason": "<one sentence on why it applies now>" }}
  ]
}}
Return {{"guidelines": []}} if none apply.
</response_format>"#
    )
}
