//! Convenience re-exports for common `cinch-context` types.
//!
//! Meant to be glob-imported by code that drives a conversation:
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! ```
//!
//! This covers the manager and its config, message and content types, the
//! collaborator traits with their reference implementations, and event
//! handlers. Strategy internals (eviction selection, summarization requests,
//! projection helpers) are left out; import those from their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ContentPart, ContextError, MediaData, Message, MessageRole, TokenUsage, ToolCall, ToolDef,
    ValidationError, json_schema_for,
};

// ── Manager ─────────────────────────────────────────────────────────
pub use crate::manager::{
    AssistantUpdate, CompactionConfig, CompositeEventHandler, ContextConfig, ContextEvent,
    ContextManager, EventHandler, FnEventHandler, FormattedContext, LlmContext, LoggingHandler,
    NoopHandler, PreparedHistory, Toggle,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::compaction::{
    MiddleRemoval, NoopCompaction, OldestRemoval, ReactiveOverflow,
};
pub use crate::context::summarizer::{FnSummaryGenerator, SummaryGenerator, SummaryRequest};
pub use crate::context::{
    ApproxTokenizer, CompactionChain, CompactionStrategy, EstimationMode, TokenEstimate,
    Tokenizer,
};

// ── Collaborators ───────────────────────────────────────────────────
pub use crate::blob::fs::FsBlobStore;
pub use crate::blob::{BlobStore, MemoryBlobStore};
pub use crate::formatter::{Formatter, OpenAiFormatter};
pub use crate::history::jsonl::JsonlHistory;
pub use crate::history::{HistoryProvider, MemoryHistory};
pub use crate::registry::{BuiltinModelRegistry, ModelRegistry};
