use agent_common::error::CommonError;

use crate::model::GuidelineId;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid guideline {id}: {reason}")]
    InvalidGuideline { id: GuidelineId, reason: String },

    #[error("guideline not found: {0}")]
    NotFound(GuidelineId),

    #[error("seed file error: {0}")]
    Seed(String),

    #[error("conversation has no turns")]
    EmptyConversation,
}
