/// Errors raised by the shared infrastructure clients.
///
/// Redis failures never surface here: the cache swallows them and reads miss.
/// Binary crates wrap `CommonError` in their own error type via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("vector db error: {0}")]
    VectorDb(String),

    #[error("embedding error: {0}")]
    Embedding(String),
}
