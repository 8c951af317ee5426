/// Shared test doubles for pipeline tests.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use agent_common::embedding::TextEmbedder;
use agent_common::error::CommonError;
use agent_common::openai::ChatCompletionRequest;

use crate::error::AppError;
use crate::llm::{CompletionError, LanguageModel};
use crate::model::{Candidate, Guideline, GuidelineId};
use crate::store::GuidelineStore;

/// Embeds text as keyword-presence vectors: dimension `i` is 1.0 when
/// `keywords[i]` occurs in the text. Can be switched to always fail.
pub struct KeywordEmbedder {
    keywords: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl KeywordEmbedder {
    pub fn new(keywords: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(&["unused"])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every query text passed to `embed_query`, in call order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        self.keywords
            .iter()
            .map(|k| if text.contains(k.as_str()) { 1.0 } else { 0.0 })
            .collect()
    }
}

#[async_trait]
impl TextEmbedder for KeywordEmbedder {
    fn model_id(&self) -> &str {
        "keyword-test"
    }

    fn dimensions(&self) -> usize {
        self.keywords.len()
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CommonError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(CommonError::Embedding("provider unreachable".to_string()));
        }
        Ok(self.vector_for(text))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CommonError::Embedding("provider unreachable".to_string()));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// A language model that replays scripted outcomes and records every request.
///
/// Panics if called more times than outcomes were scripted.
pub struct ScriptedModel {
    outcomes: Mutex<VecDeque<Result<String, CompletionError>>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(outcomes: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: ChatCompletionRequest) -> Result<String, CompletionError> {
        self.requests.lock().unwrap().push(request);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedModel: no more scripted outcomes")
    }
}

/// A store whose every operation fails, as if the database were unreachable.
pub struct UnreachableStore;

#[async_trait]
impl GuidelineStore for UnreachableStore {
    async fn fetch_by_type(&self, _is_global: bool, _enabled_only: bool) -> Result<Vec<Guideline>, AppError> {
        Err(unreachable_error())
    }

    async fn similarity_search(&self, _query: &[f32], _k: usize) -> Result<Vec<Candidate>, AppError> {
        Err(unreachable_error())
    }

    async fn insert(&self, _guideline: Guideline) -> Result<(), AppError> {
        Err(unreachable_error())
    }

    async fn replace_all(&self, _guidelines: Vec<Guideline>) -> Result<(), AppError> {
        Err(unreachable_error())
    }

    async fn set_disabled(&self, _id: GuidelineId, _disabled: bool) -> Result<(), AppError> {
        Err(unreachable_error())
    }

    async fn delete(&self, _id: GuidelineId) -> Result<(), AppError> {
        Err(unreachable_error())
    }
}

fn unreachable_error() -> AppError {
    AppError::Common(CommonError::VectorDb("connection refused".to_string()))
}

pub fn candidate(id: GuidelineId, condition: &str, directive: &str, similarity: f32) -> Candidate {
    Candidate {
        guideline: Guideline::conditional(id, condition, directive, None),
        similarity,
    }
}

/// Accept one HTTP connection on a local port and return its base URL. With a
/// response, the request is read in full and `response` is written back before
/// closing; without one, the socket is dropped unanswered.
pub async fn serve_once(response: Option<&'static str>) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let Some(response) = response else {
            drop(socket);
            return;
        };
        let mut request = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            request.extend_from_slice(&chunk[..n]);
            if n == 0 || request_complete(&request) {
                break;
            }
        }
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
    });
    format!("http://{addr}")
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}
