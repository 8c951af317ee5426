use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub type GuidelineId = i64;

/// A behavioral directive, optionally gated by a natural-language condition.
///
/// Global guidelines have neither a condition nor a condition vector; conditional
/// guidelines always carry a condition. Use [`Guideline::validate`] before storing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guideline {
    pub id: GuidelineId,
    /// When the directive applies, e.g. "customer requests refund". `None` for globals.
    pub condition: Option<String>,
    /// What the agent should do, e.g. "Offer a discount instead of a refund".
    pub directive: String,
    pub is_global: bool,
    pub is_disabled: bool,
    /// Embedding of the normalized condition text. `None` for globals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_vector: Option<Vec<f32>>,
}

impl Guideline {
    pub fn global(id: GuidelineId, directive: impl Into<String>) -> Self {
        Self {
            id,
            condition: None,
            directive: directive.into(),
            is_global: true,
            is_disabled: false,
            condition_vector: None,
        }
    }

    pub fn conditional(
        id: GuidelineId,
        condition: impl Into<String>,
        directive: impl Into<String>,
        condition_vector: Option<Vec<f32>>,
    ) -> Self {
        Self {
            id,
            condition: Some(condition.into()),
            directive: directive.into(),
            is_global: false,
            is_disabled: false,
            condition_vector,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.is_disabled = true;
        self
    }

    /// Check the global/conditional invariant and that the texts are non-empty.
    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |reason: &str| AppError::InvalidGuideline {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.directive.trim().is_empty() {
            return Err(invalid("directive text is required"));
        }
        if self.is_global {
            if self.condition.is_some() {
                return Err(invalid("global guidelines cannot have a condition"));
            }
            if self.condition_vector.is_some() {
                return Err(invalid("global guidelines cannot have a condition vector"));
            }
        } else {
            match self.condition.as_deref() {
                Some(c) if !c.trim().is_empty() => {}
                _ => return Err(invalid("condition is required for conditional guidelines")),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of the conversation being answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConversationTurn {
    /// Who sent the message: "user" or "assistant".
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A conditional guideline surfaced by similarity search, awaiting adjudication.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub guideline: Guideline,
    /// Higher is closer.
    pub similarity: f32,
}

impl Candidate {
    pub fn id(&self) -> GuidelineId {
        self.guideline.id
    }

    pub fn condition(&self) -> &str {
        self.guideline.condition.as_deref().unwrap_or_default()
    }

    pub fn directive(&self) -> &str {
        &self.guideline.directive
    }
}

/// Candidate ids accepted by the relevance filter, each with the model's justification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjudicationResult {
    reasons: BTreeMap<GuidelineId, String>,
}

impl AdjudicationResult {
    pub fn insert(&mut self, id: GuidelineId, reason: String) {
        self.reasons.insert(id, reason);
    }

    pub fn accepts(&self, id: GuidelineId) -> bool {
        self.reasons.contains_key(&id)
    }

    pub fn reason(&self, id: GuidelineId) -> Option<&str> {
        self.reasons.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// The pipeline's only output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentResponse {
    /// Reply text to show the user.
    pub message: String,
}

/// A guideline as exposed over the tool surface (no vector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GuidelineView {
    pub id: GuidelineId,
    pub condition: Option<String>,
    pub directive: String,
    pub is_global: bool,
    pub is_disabled: bool,
}

impl From<&Guideline> for GuidelineView {
    fn from(g: &Guideline) -> Self {
        Self {
            id: g.id,
            condition: g.condition.clone(),
            directive: g.directive.clone(),
            is_global: g.is_global,
            is_disabled: g.is_disabled,
        }
    }
}
