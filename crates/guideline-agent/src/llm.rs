/// Language-model seam used by the relevance filter and the response generator.
///
/// The pipeline depends on the `LanguageModel` trait, never on the HTTP client
/// directly, so tests can substitute a scripted model.
use async_trait::async_trait;

use agent_common::openai::{ChatCompletionRequest, OpenAiClient, OpenAiClientError, StatusCode};

/// Why a completion failed, bucketed by how the caller should explain it to a user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("model provider is not configured: {0}")]
    Configuration(String),

    #[error("model provider rate limit or quota exhausted: {0}")]
    RateLimited(String),

    #[error("model provider unreachable: {0}")]
    Connectivity(String),

    #[error("completion failed: {0}")]
    Other(String),
}

/// Decoding parameters shared by both model calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoding {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for Decoding {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 1000,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one chat completion and return the first choice's text.
    async fn complete(&self, request: ChatCompletionRequest) -> Result<String, CompletionError>;
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: ChatCompletionRequest) -> Result<String, CompletionError> {
        let response = self.chat_completions(&request).await?;
        response
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| OpenAiClientError::EmptyResponse.into())
    }
}

impl From<OpenAiClientError> for CompletionError {
    fn from(err: OpenAiClientError) -> Self {
        let detail = err.to_string();
        match &err {
            // Anything that broke on the wire, including a dropped socket or a
            // body cut off mid-transfer, is a connectivity problem.
            OpenAiClientError::Request(e)
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() =>
            {
                CompletionError::Connectivity(detail)
            }
            OpenAiClientError::Request(_)
            | OpenAiClientError::InvalidJson(_)
            | OpenAiClientError::EmptyResponse => CompletionError::Other(detail),
            OpenAiClientError::Upstream { status, message } => classify_status(*status, message, detail),
            OpenAiClientError::UpstreamBody { status, body } => classify_status(*status, body, detail),
        }
    }
}

fn classify_status(status: StatusCode, message: &str, detail: String) -> CompletionError {
    let lowered = message.to_lowercase();
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || lowered.contains("api key")
        || lowered.contains("api_key")
    {
        CompletionError::Configuration(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || lowered.contains("rate limit")
        || lowered.contains("quota")
    {
        CompletionError::RateLimited(detail)
    } else if status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
        || lowered.contains("timeout")
        || lowered.contains("network")
    {
        CompletionError::Connectivity(detail)
    } else {
        CompletionError::Other(detail)
    }
}
