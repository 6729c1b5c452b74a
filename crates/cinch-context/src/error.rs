//! Error types for the context manager.
//!
//! Validation and lookup failures propagate to the caller. Blob store and
//! compaction failures are absorbed close to where they happen and only
//! surface through logging and [`ContextEvent`](crate::manager::events::ContextEvent)s.

use crate::MessageRole;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid content: {0}")]
    InvalidContent(#[from] ValidationError),

    #[error("message not found: {id}")]
    MessageNotFound { id: String },

    #[error("message {id} is a {role} message, expected assistant")]
    MessageNotAssistant { id: String, role: MessageRole },

    #[error("message {id} is finalized and can no longer be mutated")]
    MessageFinalized { id: String },

    #[error("token count failed: {0}")]
    TokenCountFailed(String),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("compaction strategy '{strategy}' failed: {reason}")]
    CompactionFailed { strategy: String, reason: String },

    #[error("summarization failed: {0}")]
    Summarization(String),

    #[error("history provider error: {0}")]
    History(String),

    #[error("formatter error: {0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The validation rule a message failed on append.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("user message content must not be empty")]
    EmptyUserContent,

    #[error("user message needs a non-empty text part or an attachment")]
    UserContentWithoutPayload,

    #[error("assistant message needs content or tool calls")]
    EmptyAssistantMessage,

    #[error("tool call #{index} is missing an id")]
    ToolCallMissingId { index: usize },

    #[error("tool call #{index} is missing a function name")]
    ToolCallMissingName { index: usize },

    #[error("tool call #{index} has empty arguments")]
    ToolCallEmptyArguments { index: usize },

    #[error("tool message is missing tool_call_id")]
    ToolMissingCallId,

    #[error("tool message is missing name")]
    ToolMissingName,

    #[error("tool message is missing content")]
    ToolMissingContent,

    #[error("system message must contain text")]
    EmptySystemMessage,

    #[error("compacted_at may only be set on tool messages")]
    CompactedOnNonTool,

    #[error("summary and clear markers are created by the context manager")]
    MarkerNotAllowed,

    #[error("message id {id} already exists in this session")]
    DuplicateId { id: String },

    #[error("timestamp precedes the last stored message")]
    TimestampRegression,
}

impl ContextError {
    /// Whether the error is a tokenizer failure that must never be absorbed.
    pub fn is_token_count_failure(&self) -> bool {
        matches!(self, ContextError::TokenCountFailed(_))
    }
}
