use std::time::Duration;

use futures::stream::BoxStream;
use thiserror::Error;

use crate::error::InferenceFailure;
use crate::models::{Message, Role};
use crate::repositories::BoxFuture;

/// Stream chunks emitted during a response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    /// Terminal event. Carries the whole reply as the service saw it.
    Done { final_text: String },
}

/// Type alias for response streams. Dropping the stream cancels the request.
pub type ResponseStream = BoxStream<'static, Result<StreamChunk, InferenceError>>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference client misconfigured: {0}")]
    Configuration(String),

    #[error("Inference request failed: {0}")]
    Request(String),

    #[error("Malformed model output: {0}")]
    Malformed(String),

    #[error("Inference request exceeded {0:?}")]
    Timeout(Duration),

    #[error("Cannot complete an empty history")]
    EmptyHistory,
}

impl InferenceError {
    pub fn failure(&self) -> InferenceFailure {
        match self {
            InferenceError::Configuration(_) => InferenceFailure::Configuration,
            InferenceError::Request(_) => InferenceFailure::Request,
            InferenceError::Malformed(_) | InferenceError::EmptyHistory => InferenceFailure::Malformed,
            InferenceError::Timeout(_) => InferenceFailure::Timeout,
        }
    }
}

/// One role-tagged entry of the prompt history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.text().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Ordered oldest first. The last entry is the prompt being answered.
    pub history: Vec<HistoryEntry>,
    pub system: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Opaque text-completion backend.
pub trait InferenceService: Send + Sync + 'static {
    /// Start a completion. The returned stream yields text deltas and ends
    /// with `StreamChunk::Done` or an error.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'static, Result<ResponseStream, InferenceError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            InferenceError::Timeout(Duration::from_secs(30)).failure(),
            InferenceFailure::Timeout
        );
        assert_eq!(
            InferenceError::Request("connection refused".into()).failure(),
            InferenceFailure::Request
        );
        assert_eq!(InferenceError::EmptyHistory.failure(), InferenceFailure::Malformed);
    }

    #[test]
    fn test_history_entry_from_message() {
        let msg = Message::user("conv_1_a", "Hello");
        let entry = HistoryEntry::from(&msg);
        assert_eq!(entry.role, Role::User);
        assert_eq!(entry.content, "Hello");
    }
}
