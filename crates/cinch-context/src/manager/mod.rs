//! The context manager: one conversation's history, kept within budget.
//!
//! [`ContextManager`] is the only component that writes to the
//! [`HistoryProvider`]. The write path validates a message, offloads large
//! attachments to the blob store and appends it. The read path
//! ([`prepare_history`](ContextManager::prepare_history)) projects stored
//! history, estimates its size, and runs the compaction chain when the
//! estimate exceeds the model's input budget;
//! [`format_messages`](ContextManager::format_messages) then expands blob
//! references for the active model and hands the result to the formatter.
//!
//! State-changing operations take `&mut self`; the manager does no locking
//! of its own.

pub mod config;
pub mod events;
mod streaming;
pub mod validate;

pub use config::{BlobConfig, BlobOffloadConfig, CompactionConfig, ContextConfig, Toggle};
pub use events::{
    CompositeEventHandler, ContextEvent, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
pub use streaming::AssistantUpdate;

use crate::blob::resolver::BlobResolver;
use crate::blob::{BlobSource, BlobStore, MemoryBlobStore};
use crate::context::budget::{ActualUsage, TokenEstimate, TokenEstimator};
use crate::context::compaction::{CompactionChain, CompactionOutcome};
use crate::context::eviction::select_compactable_tool_results;
use crate::context::projection::{ProjectionStats, filter_compacted, project, substitute_placeholders};
use crate::context::summarizer::SummaryGenerator;
use crate::context::tokens::{ApproxTokenizer, Tokenizer};
use crate::formatter::{Formatter, ModelContext};
use crate::history::HistoryProvider;
use crate::registry::{BuiltinModelRegistry, DEFAULT_MAX_INPUT_TOKENS, ModelRegistry};
use crate::{
    ContentPart, ContextError, Message, MessageRole, TokenUsage, ToolCall, ToolDef,
    ValidationError,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// The provider and model the conversation is currently talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmContext {
    pub provider: String,
    pub model: String,
}

impl LlmContext {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Projected history ready for estimation or formatting.
#[derive(Debug, Clone)]
pub struct PreparedHistory {
    pub messages: Vec<Message>,
    pub stats: ProjectionStats,
    /// Estimate of the projected history before compaction.
    pub estimate: TokenEstimate,
    pub max_input_tokens: usize,
    /// Present when the estimate exceeded the budget and the chain ran.
    pub compaction: Option<CompactionOutcome>,
}

/// Provider payload plus what went into it.
#[derive(Debug, Clone)]
pub struct FormattedContext {
    pub messages: Vec<Value>,
    pub estimate: TokenEstimate,
    pub max_input_tokens: usize,
    pub stats: ProjectionStats,
    pub compaction: Option<CompactionOutcome>,
}

/// Owns one conversation's message history.
pub struct ContextManager {
    llm: LlmContext,
    history: Arc<dyn HistoryProvider>,
    formatter: Arc<dyn Formatter>,
    registry: Arc<dyn ModelRegistry>,
    blob_store: Option<Arc<dyn BlobStore>>,
    events: Arc<dyn EventHandler>,
    tokenizer: Arc<dyn Tokenizer>,
    estimator: TokenEstimator,
    summary_generator: Option<Arc<dyn SummaryGenerator>>,
    custom_chain: Option<CompactionChain>,
    config: ContextConfig,
    system_prompt: String,
    tools: Vec<ToolDef>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("llm", &self.llm)
            .field("estimator", &self.estimator)
            .field("has_blob_store", &self.blob_store.is_some())
            .field("custom_chain", &self.custom_chain)
            .field("config", &self.config)
            .finish()
    }
}

/// Generate a new message id.
fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Latest timestamp in `stored`, if any.
fn last_timestamp(stored: &[Message]) -> Option<DateTime<Utc>> {
    stored.iter().filter_map(|m| m.timestamp).max()
}

/// Now, but never earlier than the last stored message.
fn next_timestamp(stored: &[Message]) -> DateTime<Utc> {
    let now = Utc::now();
    last_timestamp(stored).map_or(now, |last| last.max(now))
}

impl ContextManager {
    pub fn new(
        llm: LlmContext,
        history: Arc<dyn HistoryProvider>,
        formatter: Arc<dyn Formatter>,
    ) -> Self {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(ApproxTokenizer::new());
        let config = ContextConfig::default();
        Self {
            llm,
            history,
            formatter,
            registry: Arc::new(BuiltinModelRegistry),
            blob_store: None,
            events: Arc::new(NoopHandler),
            estimator: Self::build_estimator(tokenizer.clone(), &config),
            tokenizer,
            summary_generator: None,
            custom_chain: None,
            config,
            system_prompt: String::new(),
            tools: Vec::new(),
        }
    }

    fn build_estimator(tokenizer: Arc<dyn Tokenizer>, config: &ContextConfig) -> TokenEstimator {
        TokenEstimator::new(tokenizer)
            .with_mode(config.estimation)
            .with_overhead_fraction(config.overhead_fraction)
    }

    // ── Builders ──

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Enable attachment offloading and blob expansion.
    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the tokenizer. Recorded usage is discarded.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.estimator = Self::build_estimator(tokenizer.clone(), &self.config);
        self.tokenizer = tokenizer;
        self
    }

    /// Replace the configuration. Recorded usage is discarded.
    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.estimator = Self::build_estimator(self.tokenizer.clone(), &config);
        self.config = config;
        self
    }

    /// Generator used by reactive-overflow summarization.
    pub fn with_summary_generator(mut self, generator: Arc<dyn SummaryGenerator>) -> Self {
        self.summary_generator = Some(generator);
        self
    }

    /// Use `chain` instead of building one from the configured strategies.
    pub fn with_compaction_chain(mut self, chain: CompactionChain) -> Self {
        self.custom_chain = Some(chain);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }

    // ── Accessors ──

    pub fn llm(&self) -> &LlmContext {
        &self.llm
    }

    /// Switch to another provider or model. Later assistant messages are
    /// stamped with it, and budget and media types follow it.
    pub fn set_llm(&mut self, llm: LlmContext) {
        info!(provider = %llm.provider, model = %llm.model, "Switching model");
        self.llm = llm;
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn tools(&self) -> &[ToolDef] {
        &self.tools
    }

    pub fn set_tools(&mut self, tools: Vec<ToolDef>) {
        self.tools = tools;
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Recorded provider usage backing hybrid estimates.
    pub fn usage_snapshot(&self) -> ActualUsage {
        self.estimator.actual()
    }

    /// Input budget of the active model.
    pub fn max_input_tokens(&self) -> usize {
        self.config
            .max_input_tokens
            .or_else(|| {
                self.registry
                    .max_input_tokens(&self.llm.provider, &self.llm.model)
            })
            .unwrap_or(DEFAULT_MAX_INPUT_TOKENS)
    }

    /// Media types blob expansion may emit for the active model.
    pub fn allowed_media_types(&self) -> Vec<String> {
        match &self.config.blob_offload.config.allowed_media_types {
            Some(types) => types.clone(),
            None => self
                .registry
                .allowed_media_types(&self.llm.provider, &self.llm.model),
        }
    }

    /// Full stored history, markers and compacted results included.
    pub async fn get_history(&self) -> Result<Vec<Message>, ContextError> {
        self.history.get_history().await
    }

    fn resolver(&self) -> Option<BlobResolver> {
        self.blob_store.as_ref().map(|store| {
            BlobResolver::new(store.clone())
                .with_events(self.events.clone())
                .with_threshold(self.config.blob_offload.config.threshold_bytes)
        })
    }

    // ── Write path ──

    /// Validate and append a message. Missing ids and timestamps are
    /// generated; the stored message is returned.
    pub async fn add_message(&mut self, mut msg: Message) -> Result<Message, ContextError> {
        validate::validate_message(&msg)?;

        let stored = self.history.get_history().await?;
        if msg.id.is_empty() {
            msg.id = new_id();
        }
        if msg.timestamp.is_none() {
            msg.timestamp = Some(next_timestamp(&stored));
        }
        validate::validate_against_history(&msg, &stored)?;

        match msg.role {
            MessageRole::Assistant => {
                msg.provider = Some(self.llm.provider.clone());
                msg.model = Some(self.llm.model.clone());
            }
            MessageRole::User | MessageRole::Tool => {
                let source = if msg.role == MessageRole::User {
                    BlobSource::User
                } else {
                    BlobSource::Tool
                };
                if self.config.blob_offload.enabled
                    && let Some(resolver) = self.resolver()
                    && let Some(parts) = msg.content.take()
                {
                    msg.content = Some(resolver.offload_parts(parts, source).await);
                }
            }
            MessageRole::System => {}
        }

        self.history.save_message(msg.clone()).await?;
        debug!(id = %msg.id, role = %msg.role, "Appended message");
        self.events.on_event(&ContextEvent::MessageAppended {
            id: &msg.id,
            role: msg.role,
        });
        Ok(msg)
    }

    pub async fn add_user_message(
        &mut self,
        parts: Vec<ContentPart>,
    ) -> Result<Message, ContextError> {
        self.add_message(Message::user_parts(parts)).await
    }

    /// Append a complete assistant reply. When `usage` is given it is
    /// recorded for hybrid estimation, with the checkpoint after this reply.
    pub async fn add_assistant_message(
        &mut self,
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
    ) -> Result<Message, ContextError> {
        let mut msg = Message::assistant_tool_calls(tool_calls);
        if let Some(text) = text {
            msg.content = Some(vec![ContentPart::text(text)]);
        }
        msg.token_usage = usage.clone();
        let msg = self.add_message(msg).await?;
        if let Some(usage) = usage {
            self.record_usage(&usage).await?;
        }
        Ok(msg)
    }

    pub async fn add_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: Vec<ContentPart>,
        success: bool,
    ) -> Result<Message, ContextError> {
        let mut msg = Message::tool_result(tool_call_id, name, "");
        msg.content = Some(content);
        msg.success = Some(success);
        self.add_message(msg).await
    }

    /// Record provider-reported usage for the call that produced the last
    /// stored message.
    pub async fn record_usage(&mut self, usage: &TokenUsage) -> Result<(), ContextError> {
        let count = self.history.get_history().await?.len();
        self.estimator
            .record_actual(usage.input_tokens, usage.output_tokens, count);
        self.events.on_event(&ContextEvent::UsageRecorded {
            usage,
            checkpoint_message_count: count,
        });
        Ok(())
    }

    /// Append a context-cleared marker. Returns the marker id.
    pub async fn clear_context(&mut self) -> Result<String, ContextError> {
        let stored = self.history.get_history().await?;
        let now = next_timestamp(&stored);
        let mut marker = Message::clear_marker(now).with_id(new_id());
        marker.timestamp = Some(now);
        self.history.save_message(marker.clone()).await?;
        self.estimator.reset_actual();
        info!(marker = %marker.id, "Cleared context");
        self.events
            .on_event(&ContextEvent::ContextCleared { marker_id: &marker.id });
        Ok(marker.id)
    }

    /// Delete the stored history.
    pub async fn reset_conversation(&mut self) -> Result<(), ContextError> {
        self.history.clear_history().await?;
        self.estimator.reset_actual();
        info!("Reset conversation");
        self.events.on_event(&ContextEvent::ConversationReset);
        Ok(())
    }

    /// Flag every visible tool result except the `keep_recent` newest (and
    /// protected tools) as compacted. Returns the flagged ids.
    pub async fn compact_old_tool_results(
        &mut self,
        keep_recent: usize,
    ) -> Result<Vec<String>, ContextError> {
        let stored = self.history.get_history().await?;
        let visible = filter_compacted(&stored);
        let config = self
            .config
            .tool_result_compaction
            .clone()
            .with_keep_recent(keep_recent);
        let ids = select_compactable_tool_results(
            &visible,
            self.tokenizer.as_ref(),
            &config,
            &self.config.placeholder_text,
            None,
        )?;
        self.mark_messages_compacted(&ids).await
    }

    /// Set `compacted_at` on the given tool results. Already-compacted ones
    /// are left alone. Returns the ids that changed.
    pub async fn mark_messages_compacted(
        &mut self,
        ids: &[String],
    ) -> Result<Vec<String>, ContextError> {
        let stored = self.history.get_history().await?;
        let mut updates = Vec::new();
        for id in ids {
            let msg = stored
                .iter()
                .find(|m| &m.id == id)
                .ok_or_else(|| ContextError::MessageNotFound { id: id.clone() })?;
            if msg.role != MessageRole::Tool {
                return Err(ValidationError::CompactedOnNonTool.into());
            }
            if msg.compacted_at.is_none() && !updates.iter().any(|m: &Message| &m.id == id) {
                updates.push(msg.clone());
            }
        }

        let now = Utc::now();
        let mut changed = Vec::with_capacity(updates.len());
        for mut msg in updates {
            msg.compacted_at = Some(now);
            changed.push(msg.id.clone());
            self.history.update_message(msg).await?;
        }
        if !changed.is_empty() {
            info!(count = changed.len(), "Marked tool results as compacted");
            self.events
                .on_event(&ContextEvent::ToolResultsCompacted { ids: &changed });
        }
        Ok(changed)
    }

    // ── Read path ──

    fn estimate_projected(
        &self,
        stored: &[Message],
        projected: &[Message],
    ) -> Result<TokenEstimate, ContextError> {
        let tail = self
            .estimator
            .checkpoint()
            .and_then(|cp| stored.get(cp..))
            .map(|tail| {
                let (window, _) = project_tail(tail, &self.config.placeholder_text);
                window
            });
        self.estimator
            .estimate(&self.system_prompt, &self.tools, projected, tail.as_deref())
    }

    /// Estimate the next call without compacting.
    pub async fn estimate_tokens(&self) -> Result<TokenEstimate, ContextError> {
        let stored = self.history.get_history().await?;
        let (projected, _) = project(&stored, &self.config.placeholder_text);
        self.estimate_projected(&stored, &projected)
    }

    /// Project stored history and compact it if it exceeds the budget.
    ///
    /// A summary marker produced by compaction is persisted, and recorded
    /// usage is discarded since it no longer describes the history.
    pub async fn prepare_history(&mut self) -> Result<PreparedHistory, ContextError> {
        let stored = self.history.get_history().await?;
        let (projected, stats) = project(&stored, &self.config.placeholder_text);
        let estimate = self.estimate_projected(&stored, &projected)?;
        let max_input_tokens = self.max_input_tokens();
        debug!("{}", estimate.to_log_string(max_input_tokens));
        self.events.on_event(&ContextEvent::Estimated {
            estimate: &estimate,
            max_input_tokens,
        });

        if estimate.total <= max_input_tokens {
            return Ok(PreparedHistory {
                messages: projected,
                stats,
                estimate,
                max_input_tokens,
                compaction: None,
            });
        }

        let system_tokens = self.estimator.system_prompt_tokens(&self.system_prompt)?;
        let target = max_input_tokens.saturating_sub(system_tokens);
        info!(
            estimate = estimate.total,
            max_input_tokens, target, "Context over budget; compacting"
        );

        let built;
        let chain = match &self.custom_chain {
            Some(chain) => chain,
            None => {
                built = config::build_chain(&self.config.compaction, self.summary_generator.clone());
                &built
            }
        };
        let mut outcome = chain.run(projected, self.tokenizer.as_ref(), target).await?;

        if let Some(failure) = &outcome.failure {
            self.events.on_event(&ContextEvent::CompactionFailed {
                strategy: &failure.strategy,
                error: &failure.reason,
            });
        }
        if outcome.changed() {
            let strategies: Vec<String> = outcome.steps.iter().map(|s| s.strategy.clone()).collect();
            self.events.on_event(&ContextEvent::CompactionApplied {
                strategies: &strategies,
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
                target,
            });
        }
        if outcome.tokens_after > target {
            warn!(
                tokens = outcome.tokens_after,
                target, "Compaction could not bring the context under budget"
            );
        }

        self.persist_summary(&stored, &mut outcome).await?;

        Ok(PreparedHistory {
            messages: outcome.messages.clone(),
            stats,
            estimate,
            max_input_tokens,
            compaction: Some(outcome),
        })
    }

    /// Write a summary marker introduced by compaction to storage and swap
    /// the persisted copy into `outcome`.
    async fn persist_summary(
        &mut self,
        stored: &[Message],
        outcome: &mut CompactionOutcome,
    ) -> Result<(), ContextError> {
        let Some(anchor) = outcome.summary.clone() else {
            return Ok(());
        };
        let Some(slot) = outcome
            .messages
            .iter_mut()
            .find(|m| m.id == anchor.marker_id)
        else {
            return Ok(());
        };

        // Stored index of the first message the summary left in place.
        let summarized_through = anchor
            .first_retained
            .and_then(|id| stored.iter().position(|m| m.id == id))
            .unwrap_or(stored.len());

        let mut marker = slot.clone();
        if stored.iter().any(|m| m.id == marker.id) {
            marker.id = new_id();
        }
        marker.metadata.summarized_through = Some(summarized_through);
        marker.timestamp = Some(next_timestamp(stored));

        self.history.save_message(marker.clone()).await?;
        self.estimator.reset_actual();
        info!(id = %marker.id, summarized_through, "Persisted summary marker");
        self.events.on_event(&ContextEvent::SummaryPersisted {
            id: &marker.id,
            summarized_through,
        });
        *slot = marker;
        Ok(())
    }

    /// Build the provider payload for the active model.
    pub async fn format_messages(&mut self) -> Result<FormattedContext, ContextError> {
        let prepared = self.prepare_history().await?;
        let allowed = self.allowed_media_types();

        // Without a store, references cannot resolve and degrade to notices.
        let resolver = self.resolver().unwrap_or_else(|| {
            BlobResolver::new(Arc::new(MemoryBlobStore::new())).with_events(self.events.clone())
        });
        let mut expanded = Vec::with_capacity(prepared.messages.len());
        for mut msg in prepared.messages {
            if let Some(parts) = msg.content.take() {
                msg.content = Some(resolver.expand(parts, Some(allowed.as_slice())).await);
            }
            expanded.push(msg);
        }

        let model = ModelContext {
            provider: self.llm.provider.clone(),
            model: self.llm.model.clone(),
            allowed_media_types: allowed,
        };
        let system_prompt = (!self.system_prompt.is_empty()).then_some(self.system_prompt.as_str());
        let messages = self.formatter.format(&expanded, &model, system_prompt)?;
        trace!(
            messages = messages.len(),
            bytes = serde_json::to_string(&messages).map(|s| s.len()).unwrap_or(0),
            "Formatted provider payload"
        );

        Ok(FormattedContext {
            messages,
            estimate: prepared.estimate,
            max_input_tokens: prepared.max_input_tokens,
            stats: prepared.stats,
            compaction: prepared.compaction,
        })
    }

    /// Make every write so far durable.
    pub async fn flush(&self) -> Result<(), ContextError> {
        self.history.flush().await
    }
}

/// Messages appended after a usage checkpoint, as the model will see them.
fn project_tail(tail: &[Message], placeholder: &str) -> (Vec<Message>, usize) {
    let visible: Vec<Message> = tail
        .iter()
        .filter(|m| !(m.is_streaming() && m.is_empty()))
        .cloned()
        .collect();
    substitute_placeholders(visible, placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::formatter::OpenAiFormatter;
    use crate::history::MemoryHistory;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn count_tokens(&self, text: &str) -> Result<usize, ContextError> {
            Ok(text.split_whitespace().count())
        }
    }

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    fn manager() -> ContextManager {
        ContextManager::new(
            LlmContext::new("openai", "gpt-4o"),
            Arc::new(MemoryHistory::new()),
            Arc::new(OpenAiFormatter),
        )
        .with_tokenizer(Arc::new(WordTokenizer))
    }

    #[tokio::test]
    async fn append_assigns_id_timestamp_and_stamps_model() {
        let mut mgr = manager();
        let user = mgr.add_user_message(vec![ContentPart::text("hi")]).await.unwrap();
        assert!(!user.id.is_empty());
        assert!(user.timestamp.is_some());
        assert!(user.provider.is_none());

        let reply = mgr
            .add_assistant_message(Some("hello".into()), vec![], None)
            .await
            .unwrap();
        assert_eq!(reply.provider.as_deref(), Some("openai"));
        assert_eq!(reply.model.as_deref(), Some("gpt-4o"));

        mgr.set_llm(LlmContext::new("anthropic", "claude-sonnet-4"));
        let reply = mgr
            .add_assistant_message(Some("again".into()), vec![], None)
            .await
            .unwrap();
        assert_eq!(reply.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(mgr.max_input_tokens(), 200_000);

        let stored = mgr.get_history().await.unwrap();
        let ids: HashSet<&str> = stored.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let mut mgr = manager();
        mgr.add_message(Message::user("a").with_id("x")).await.unwrap();
        let err = mgr
            .add_message(Message::user("b").with_id("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::InvalidContent(ValidationError::DuplicateId { .. })
        ));
    }

    #[tokio::test]
    async fn caller_supplied_marker_is_rejected() {
        let mut mgr = manager();
        mgr.add_user_message(vec![ContentPart::text("a")]).await.unwrap();
        let err = mgr
            .add_message(Message::summary("nothing happened", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContextError::InvalidContent(ValidationError::MarkerNotAllowed)
        ));
        assert_eq!(mgr.get_history().await.unwrap().len(), 1);

        // The manager's own markers still go through.
        mgr.clear_context().await.unwrap();
        assert!(mgr.get_history().await.unwrap()[1].is_marker());
    }

    #[tokio::test]
    async fn large_attachment_is_offloaded_on_append() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut mgr = manager().with_blob_store(store.clone());
        let msg = mgr
            .add_user_message(vec![
                ContentPart::text("see"),
                ContentPart::image(vec![7u8; 10 * 1024], "image/png"),
            ])
            .await
            .unwrap();
        let parts = msg.content.unwrap();
        assert!(parts[1].media_data().and_then(|d| d.blob_uri()).is_some());
        assert_eq!(store.len(), 1);

        let disabled = Arc::new(MemoryBlobStore::new());
        let mut mgr = manager()
            .with_blob_store(disabled.clone())
            .with_config(ContextConfig::default().with_blob_offload(Toggle::disabled()));
        mgr.add_user_message(vec![ContentPart::image(vec![7u8; 10 * 1024], "image/png")])
            .await
            .unwrap();
        assert!(disabled.is_empty());
    }

    #[tokio::test]
    async fn usage_is_reset_by_clear_and_reset() {
        let mut mgr = manager();
        mgr.add_user_message(vec![ContentPart::text("hi")]).await.unwrap();
        mgr.add_assistant_message(Some("hello".into()), vec![], Some(TokenUsage::new(10, 2)))
            .await
            .unwrap();
        assert_eq!(mgr.usage_snapshot().checkpoint_message_count, Some(2));

        mgr.clear_context().await.unwrap();
        assert_eq!(mgr.usage_snapshot(), ActualUsage::default());

        mgr.record_usage(&TokenUsage::new(5, 5)).await.unwrap();
        mgr.reset_conversation().await.unwrap();
        assert_eq!(mgr.usage_snapshot(), ActualUsage::default());
        assert!(mgr.get_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compacting_tool_results_keeps_storage() {
        let mut mgr = manager();
        mgr.add_user_message(vec![ContentPart::text("go")]).await.unwrap();
        for i in 0..3 {
            mgr.add_tool_result(
                format!("c{i}"),
                "read_file",
                vec![ContentPart::text(words(40))],
                true,
            )
            .await
            .unwrap();
        }

        let flagged = mgr.compact_old_tool_results(1).await.unwrap();
        assert_eq!(flagged.len(), 2);
        // Already compacted results are not flagged twice.
        assert!(mgr.mark_messages_compacted(&flagged).await.unwrap().is_empty());

        let stored = mgr.get_history().await.unwrap();
        assert!(stored.iter().all(|m| m.text() != "[Old tool result content cleared]"));

        let prepared = mgr.prepare_history().await.unwrap();
        let placeholders = prepared
            .messages
            .iter()
            .filter(|m| m.text() == "[Old tool result content cleared]")
            .count();
        assert_eq!(placeholders, 2);
        assert_eq!(prepared.stats.placeholders, 2);

        let user_id = stored[0].id.clone();
        let err = mgr.mark_messages_compacted(&[user_id]).await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::InvalidContent(ValidationError::CompactedOnNonTool)
        ));
    }

    #[tokio::test]
    async fn summary_is_persisted_with_stored_index() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut mgr = manager()
            .with_config(
                ContextConfig::default()
                    .with_max_input_tokens(500)
                    .with_compaction(vec![CompactionConfig::ReactiveOverflow {
                        preserve_last_turns: 1,
                        max_summary_tokens: 256,
                    }]),
            )
            .with_events(Arc::new(FnEventHandler::new(move |event| {
                if let ContextEvent::SummaryPersisted {
                    summarized_through, ..
                } = event
                {
                    sink.lock().unwrap().push(*summarized_through);
                }
            })));

        for _ in 0..3 {
            mgr.add_user_message(vec![ContentPart::text(words(200))]).await.unwrap();
            mgr.add_assistant_message(Some(words(200)), vec![], None)
                .await
                .unwrap();
        }

        let prepared = mgr.prepare_history().await.unwrap();
        assert!(prepared.messages[0].is_marker());
        assert_eq!(prepared.messages.len(), 3);
        assert_eq!(*events.lock().unwrap(), vec![4]);

        let stored = mgr.get_history().await.unwrap();
        assert_eq!(stored.len(), 7);
        assert_eq!(stored[6].metadata.summarized_through, Some(4));
        assert_eq!(prepared.messages[0], stored[6]);

        // The persisted marker reproduces the compacted projection, and
        // there is nothing left to summarize.
        let again = mgr.prepare_history().await.unwrap();
        assert!(!again.compaction.as_ref().is_some_and(CompactionOutcome::changed));
        assert_eq!(again.messages, prepared.messages);
        assert_eq!(mgr.get_history().await.unwrap().len(), 7);
    }
}
