//! Conversation context management for LLM agents.
//!
//! `cinch-context` owns the message history of a single conversation and
//! turns it into a provider-ready payload on demand. The central type is the
//! [`ContextManager`](manager::ContextManager): it validates and appends
//! messages, offloads large attachments to a blob store, keeps the projected
//! history under the model's input budget, and hands the result to a
//! provider-specific [`Formatter`](formatter::Formatter).
//!
//! # Getting started
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! use std::sync::Arc;
//!
//! let mut manager = ContextManager::new(
//!     LlmContext::new("openai", "gpt-4o"),
//!     Arc::new(MemoryHistory::new()),
//!     Arc::new(OpenAiFormatter),
//! )
//! .with_system_prompt("You are a helpful assistant.")
//! .with_blob_store(Arc::new(MemoryBlobStore::new()));
//!
//! manager.add_user_message(vec![ContentPart::text("Summarize main.rs")]).await?;
//! let payload = manager.format_messages().await?;
//! println!("{} provider messages", payload.messages.len());
//! ```
//!
//! # Where to find things
//!
//! - **Append and stream messages:** [`ContextManager`](manager::ContextManager)
//!   and the validation rules in [`manager::validate`].
//! - **Budgets:** [`TokenEstimator`](context::budget::TokenEstimator) for
//!   heuristic and hybrid (actual-usage) estimates, [`Tokenizer`](context::tokens::Tokenizer)
//!   for pluggable token counting.
//! - **Compaction:** the [`CompactionStrategy`](context::compaction::CompactionStrategy)
//!   trait, its implementations, and [`context::eviction`] for marking old tool
//!   results as compacted.
//! - **Read projection:** [`context::projection`] for marker filtering and
//!   placeholder substitution.
//! - **Attachments:** [`BlobResolver`](blob::resolver::BlobResolver) and the
//!   [`BlobStore`](blob::BlobStore) trait.
//! - **Storage:** the [`HistoryProvider`](history::HistoryProvider) trait with
//!   in-memory and JSON-lines implementations.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`manager`] | Orchestrator, validation, streaming mutation, config, events |
//! | [`context`] | Tokenizer, budget estimation, compaction, eviction, projection, summarization |
//! | [`blob`] | Blob store trait, in-memory and filesystem stores, offload/expand resolver |
//! | [`history`] | History provider trait, in-memory and JSON-lines providers |
//! | [`formatter`] | Provider payload formatting (OpenAI chat completions) |
//! | [`registry`] | Model context windows and accepted media types |

pub mod blob;
pub mod context;
pub mod error;
pub mod formatter;
pub mod history;
pub mod manager;
pub mod prelude;
pub mod registry;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{ContextError, ValidationError};

// Re-export schemars for downstream crates.
pub use schemars;

/// Prefix of a blob reference token (`@blob:<uri>`).
pub const BLOB_REF_PREFIX: &str = "@blob:";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Used to build [`ToolDef`] parameters whose size is
/// counted by the token estimator.
///
/// # Example
///
/// ```
/// use cinch_context::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct GrepArgs {
///     pattern: String,
///     #[serde(default)]
///     path: Option<String>,
/// }
///
/// let schema = json_schema_for::<GrepArgs>();
/// assert_eq!(schema["type"], "object");
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Attachment payload: a string (base64, data URI, URL, or `@blob:` reference)
/// or raw bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum MediaData {
    Text(String),
    Bytes(Vec<u8>),
}

impl MediaData {
    /// The blob URI if this value is a `@blob:` reference.
    pub fn blob_uri(&self) -> Option<&str> {
        match self {
            MediaData::Text(s) => s.strip_prefix(BLOB_REF_PREFIX),
            MediaData::Bytes(_) => None,
        }
    }

    /// Whether the value is a remote or local URL (never offloaded).
    pub fn is_url(&self) -> bool {
        match self {
            MediaData::Text(s) => {
                s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
            }
            MediaData::Bytes(_) => false,
        }
    }
}

impl From<String> for MediaData {
    fn from(s: String) -> Self {
        MediaData::Text(s)
    }
}

impl From<&str> for MediaData {
    fn from(s: &str) -> Self {
        MediaData::Text(s.to_string())
    }
}

impl From<Vec<u8>> for MediaData {
    fn from(bytes: Vec<u8>) -> Self {
        MediaData::Bytes(bytes)
    }
}

/// One typed unit of message content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        data: MediaData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    File {
        data: MediaData,
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    UiResource {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(data: impl Into<MediaData>, mime_type: impl Into<String>) -> Self {
        ContentPart::Image {
            data: data.into(),
            mime_type: Some(mime_type.into()),
        }
    }

    pub fn file(
        data: impl Into<MediaData>,
        mime_type: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        ContentPart::File {
            data: data.into(),
            mime_type: mime_type.into(),
            filename,
        }
    }

    /// Text of a `text` part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Whether this is an image or file part.
    pub fn is_attachment(&self) -> bool {
        matches!(self, ContentPart::Image { .. } | ContentPart::File { .. })
    }

    /// Declared media type of an attachment or UI resource.
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            ContentPart::Text { .. } => None,
            ContentPart::Image { mime_type, .. } => mime_type.as_deref(),
            ContentPart::File { mime_type, .. } => Some(mime_type),
            ContentPart::UiResource { mime_type, .. } => mime_type.as_deref(),
        }
    }

    /// Attachment payload of an image or file part.
    pub fn media_data(&self) -> Option<&MediaData> {
        match self {
            ContentPart::Image { data, .. } | ContentPart::File { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Approval state of a tool execution.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Token usage reported by the provider for one call.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }
}

/// Whether a message may still be mutated in place.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Finalized and immutable.
    #[default]
    Complete,
    /// An assistant message whose response is still streaming.
    Streaming,
}

impl MessageState {
    fn is_complete(&self) -> bool {
        *self == MessageState::Complete
    }
}

/// Annotations that change how the read projection treats a message.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Marks a summary or context-cleared boundary.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
    /// Number of stored messages a summary marker replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_through: Option<usize>,
    /// Set on explicit "context cleared" markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_at: Option<DateTime<Utc>>,
}

impl MessageMetadata {
    fn is_empty(&self) -> bool {
        *self == MessageMetadata::default()
    }
}

/// A message in the conversation.
///
/// Role-specific fields are optional and only meaningful for their role;
/// [`manager::validate`] enforces which ones must be present.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique within the session. Empty until assigned on append.
    #[serde(default)]
    pub id: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "MessageState::is_complete")]
    pub state: MessageState,

    // Assistant fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    // Tool fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
}

impl Message {
    fn bare(role: MessageRole, content: Option<Vec<ContentPart>>) -> Self {
        Self {
            id: String::new(),
            role,
            content,
            timestamp: None,
            state: MessageState::Complete,
            tool_calls: Vec::new(),
            token_usage: None,
            reasoning: None,
            provider: None,
            model: None,
            tool_call_id: None,
            name: None,
            success: None,
            display_data: None,
            requires_approval: None,
            approval_status: None,
            compacted_at: None,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(MessageRole::System, Some(vec![ContentPart::text(content)]))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(MessageRole::User, Some(vec![ContentPart::text(content)]))
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::bare(MessageRole::User, Some(parts))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::bare(MessageRole::Assistant, Some(vec![ContentPart::text(content)]))
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::bare(MessageRole::Assistant, None);
        msg.tool_calls = calls;
        msg
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::bare(MessageRole::Tool, Some(vec![ContentPart::text(content)]));
        msg.tool_call_id = Some(call_id.into());
        msg.name = Some(name.into());
        msg.success = Some(true);
        msg
    }

    /// A summary marker carrying `summary` text.
    pub fn summary(summary: impl Into<String>, summarized_through: usize) -> Self {
        let mut msg = Self::assistant_text(summary);
        msg.metadata.is_summary = true;
        msg.metadata.summarized_through = Some(summarized_through);
        msg
    }

    /// An explicit "context cleared" marker.
    pub fn clear_marker(cleared_at: DateTime<Utc>) -> Self {
        let mut msg = Self::assistant_text("[Context cleared]");
        msg.metadata.is_summary = true;
        msg.metadata.cleared_at = Some(cleared_at);
        msg
    }

    /// Builder-style id assignment.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .flatten()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether this message resets the read-projection window.
    pub fn is_marker(&self) -> bool {
        self.metadata.is_summary
    }

    /// Whether this is an explicit context-cleared marker.
    pub fn is_clear_marker(&self) -> bool {
        self.metadata.is_summary && self.metadata.cleared_at.is_some()
    }

    /// Whether this assistant message is still being streamed.
    pub fn is_streaming(&self) -> bool {
        self.state == MessageState::Streaming
    }

    /// Whether the message has neither content parts nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.as_ref().is_none_or(|c| c.is_empty()) && self.tool_calls.is_empty()
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the provider (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}
