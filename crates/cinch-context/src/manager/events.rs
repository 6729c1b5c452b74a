//! Events and handlers for the [`ContextManager`](super::ContextManager).
//!
//! The manager reports what it did to storage and to the projected history
//! through [`ContextEvent`] variants. Blob and compaction failures never
//! propagate as errors, so events are also how callers learn about them.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget sessions |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Cache invalidation, metrics, UI updates |

use crate::context::budget::TokenEstimate;
use crate::{MessageRole, TokenUsage};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the context manager.
#[derive(Debug)]
pub enum ContextEvent<'a> {
    /// A message was validated and persisted.
    MessageAppended { id: &'a str, role: MessageRole },
    /// An attachment was moved to the blob store. Caches keyed by message
    /// content should be invalidated.
    BlobStored {
        uri: &'a str,
        mime_type: &'a str,
        bytes: usize,
    },
    /// A blob reference could not be resolved and was replaced by a notice.
    BlobExpansionFailed { uri: &'a str, error: &'a str },
    /// The compaction chain reduced the projected history.
    CompactionApplied {
        strategies: &'a [String],
        tokens_before: usize,
        tokens_after: usize,
        target: usize,
    },
    /// A compaction strategy failed; the rest of the chain was skipped.
    CompactionFailed { strategy: &'a str, error: &'a str },
    /// A summary marker produced by compaction was written to storage.
    SummaryPersisted {
        id: &'a str,
        summarized_through: usize,
    },
    /// Tool results were flagged as compacted.
    ToolResultsCompacted { ids: &'a [String] },
    /// A context-cleared marker was appended.
    ContextCleared { marker_id: &'a str },
    /// Stored history was deleted.
    ConversationReset,
    /// Provider usage was recorded for hybrid estimation.
    UsageRecorded {
        usage: &'a TokenUsage,
        checkpoint_message_count: usize,
    },
    /// A token estimate was computed while preparing history.
    Estimated {
        estimate: &'a TokenEstimate,
        max_input_tokens: usize,
    },
}

/// Observer for [`ContextEvent`]s.
///
/// # Example
///
/// ```ignore
/// struct CacheInvalidator { cache: Arc<PromptCache> }
///
/// impl EventHandler for CacheInvalidator {
///     fn on_event(&self, event: &ContextEvent<'_>) {
///         if let ContextEvent::BlobStored { .. } = event {
///             self.cache.invalidate();
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ContextEvent<'_>) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// # Example
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ContextEvent::SummaryPersisted { id, .. } = event {
///         println!("summarized into {id}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ContextEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ContextEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that delegates to multiple inner handlers, in
/// registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_cache_invalidator);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        match event {
            ContextEvent::MessageAppended { id, role } => {
                debug!("Appended {role} message {id}");
            }
            ContextEvent::BlobStored {
                uri,
                mime_type,
                bytes,
            } => {
                debug!("Offloaded {bytes} bytes ({mime_type}) to blob {uri}");
            }
            ContextEvent::BlobExpansionFailed { uri, error } => {
                warn!("Blob {uri} unavailable: {error}");
            }
            ContextEvent::CompactionApplied {
                strategies,
                tokens_before,
                tokens_after,
                target,
            } => {
                info!(
                    "Compacted context {tokens_before} -> {tokens_after} tokens (target {target}) via {}",
                    strategies.join(", ")
                );
            }
            ContextEvent::CompactionFailed { strategy, error } => {
                warn!("Compaction strategy {strategy} failed: {error}");
            }
            ContextEvent::SummaryPersisted {
                id,
                summarized_through,
            } => {
                info!("Persisted summary {id} (through stored index {summarized_through})");
            }
            ContextEvent::ToolResultsCompacted { ids } => {
                info!("Marked {} tool result(s) as compacted", ids.len());
            }
            ContextEvent::ContextCleared { marker_id } => {
                info!("Context cleared ({marker_id})");
            }
            ContextEvent::ConversationReset => {
                info!("Conversation reset");
            }
            ContextEvent::UsageRecorded {
                usage,
                checkpoint_message_count,
            } => {
                debug!(
                    "Usage: input={}, output={} at {checkpoint_message_count} messages",
                    usage.input_tokens, usage.output_tokens
                );
            }
            ContextEvent::Estimated {
                estimate,
                max_input_tokens,
            } => {
                debug!("{}", estimate.to_log_string(*max_input_tokens));
            }
        }
    }
}
