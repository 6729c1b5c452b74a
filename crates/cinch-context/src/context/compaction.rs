//! Compaction strategies and the chain that runs them.
//!
//! A [`CompactionStrategy`] takes a projected history and returns a smaller
//! one. Every strategy is deterministic for the same input, never returns
//! more tokens than it was given, and keeps the relative order of the
//! messages it retains. [`CompactionChain`] runs strategies in order,
//! re-counting after each one, and stops as soon as the history fits.
//!
//! | Strategy | Removes | LLM call |
//! |----------|---------|----------|
//! | [`NoopCompaction`] | nothing | no |
//! | [`OldestRemoval`] | messages from the front | no |
//! | [`MiddleRemoval`] | messages from the centre outward | no |
//! | [`ReactiveOverflow`] | everything older than the last N turns, replaced by a summary | optional |

use crate::context::summarizer::{
    SummarizerConfig, SummaryGenerator, build_summarization_request, fallback_digest,
};
use crate::context::tokens::{Tokenizer, messages_tokens, per_message_tokens};
use crate::{ContextError, Message, MessageRole};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Boxed future returned by [`CompactionStrategy::compress`].
pub type CompactionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<Message>, ContextError>> + Send + 'a>>;

/// One step of history reduction.
pub trait CompactionStrategy: Send + Sync {
    /// Short name used in logs and events.
    fn name(&self) -> &str;

    /// Reduce `history` toward `target_tokens`.
    ///
    /// Must be deterministic, must not increase the token count, and must
    /// keep retained messages in their original order. Tokenizer failures
    /// are returned, never replaced by a guess.
    fn compress<'a>(
        &'a self,
        history: Vec<Message>,
        tokenizer: &'a dyn Tokenizer,
        target_tokens: usize,
    ) -> CompactionFuture<'a>;
}

// ── No-op ──────────────────────────────────────────────────────────

/// Returns the history unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompaction;

impl CompactionStrategy for NoopCompaction {
    fn name(&self) -> &str {
        "noop"
    }

    fn compress<'a>(
        &'a self,
        history: Vec<Message>,
        _tokenizer: &'a dyn Tokenizer,
        _target_tokens: usize,
    ) -> CompactionFuture<'a> {
        Box::pin(async move { Ok(history) })
    }
}

// ── Oldest removal ─────────────────────────────────────────────────

/// Drops messages from the front until the history fits or only
/// `min_messages_to_keep` remain.
///
/// Tool results left at the front without their assistant call are dropped
/// along with it.
#[derive(Debug, Clone, Copy)]
pub struct OldestRemoval {
    pub min_messages_to_keep: usize,
}

impl Default for OldestRemoval {
    fn default() -> Self {
        Self {
            min_messages_to_keep: 4,
        }
    }
}

impl OldestRemoval {
    fn select(&self, history: &[Message], tokens: &[usize], target: usize) -> usize {
        let n = history.len();
        let mut total: usize = tokens.iter().sum();
        let mut start = 0;
        while total > target && n - start > self.min_messages_to_keep {
            total -= tokens[start];
            start += 1;
        }
        if start > 0 {
            while start < n
                && n - start > self.min_messages_to_keep
                && history[start].role == MessageRole::Tool
            {
                start += 1;
            }
        }
        start
    }
}

impl CompactionStrategy for OldestRemoval {
    fn name(&self) -> &str {
        "oldest_removal"
    }

    fn compress<'a>(
        &'a self,
        history: Vec<Message>,
        tokenizer: &'a dyn Tokenizer,
        target_tokens: usize,
    ) -> CompactionFuture<'a> {
        Box::pin(async move {
            let tokens = per_message_tokens(tokenizer, &history)?;
            let start = self.select(&history, &tokens, target_tokens);
            if start > 0 {
                debug!(removed = start, "Dropped oldest messages");
            }
            Ok(history.into_iter().skip(start).collect())
        })
    }
}

// ── Middle removal ─────────────────────────────────────────────────

/// Keeps the first `preserve_head` and last `preserve_tail` messages and
/// drops messages from the centre of the middle outward until the history
/// fits.
#[derive(Debug, Clone, Copy)]
pub struct MiddleRemoval {
    pub preserve_head: usize,
    pub preserve_tail: usize,
}

impl Default for MiddleRemoval {
    fn default() -> Self {
        Self {
            preserve_head: 2,
            preserve_tail: 4,
        }
    }
}

impl MiddleRemoval {
    fn removal_order(&self, len: usize) -> Vec<usize> {
        if len <= self.preserve_head + self.preserve_tail {
            return Vec::new();
        }
        let lo = self.preserve_head;
        let hi = len - self.preserve_tail - 1;
        let mut order: Vec<usize> = (lo..=hi).collect();
        // Distance from the centre of [lo, hi], doubled to stay integral.
        order.sort_by_key(|&i| ((2 * i).abs_diff(lo + hi), i));
        order
    }
}

impl CompactionStrategy for MiddleRemoval {
    fn name(&self) -> &str {
        "middle_removal"
    }

    fn compress<'a>(
        &'a self,
        history: Vec<Message>,
        tokenizer: &'a dyn Tokenizer,
        target_tokens: usize,
    ) -> CompactionFuture<'a> {
        Box::pin(async move {
            let tokens = per_message_tokens(tokenizer, &history)?;
            let mut total: usize = tokens.iter().sum();
            let mut removed = vec![false; history.len()];
            for idx in self.removal_order(history.len()) {
                if total <= target_tokens {
                    break;
                }
                removed[idx] = true;
                total -= tokens[idx];
            }
            let count = removed.iter().filter(|r| **r).count();
            if count > 0 {
                debug!(removed = count, "Dropped middle messages");
            }
            Ok(history
                .into_iter()
                .zip(removed)
                .filter_map(|(m, r)| (!r).then_some(m))
                .collect())
        })
    }
}

// ── Reactive overflow ──────────────────────────────────────────────

/// Keeps the last `preserve_last_turns` turns verbatim and replaces every
/// older message with a single summary marker.
///
/// A turn starts at a user message and runs up to the next one. A summary
/// marker already leading the history is merged into the new summary. The
/// new marker's `summarized_through` is the index, in the input history, of
/// the first retained message.
pub struct ReactiveOverflow {
    pub preserve_last_turns: usize,
    generator: Option<Arc<dyn SummaryGenerator>>,
    config: SummarizerConfig,
}

impl std::fmt::Debug for ReactiveOverflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveOverflow")
            .field("preserve_last_turns", &self.preserve_last_turns)
            .field("has_generator", &self.generator.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl ReactiveOverflow {
    pub fn new(preserve_last_turns: usize) -> Self {
        Self {
            preserve_last_turns,
            generator: None,
            config: SummarizerConfig::default(),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn SummaryGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_config(mut self, config: SummarizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Index of the first message to keep, or `None` if there is nothing
    /// older than the preserved turns.
    fn split_index(&self, history: &[Message], body_start: usize) -> Option<usize> {
        let split = if self.preserve_last_turns == 0 {
            history.len()
        } else {
            let turn_starts: Vec<usize> = history
                .iter()
                .enumerate()
                .skip(body_start)
                .filter(|(_, m)| m.role == MessageRole::User)
                .map(|(i, _)| i)
                .collect();
            let first_kept = turn_starts.len().checked_sub(self.preserve_last_turns)?;
            turn_starts[first_kept]
        };
        (split > body_start).then_some(split)
    }

    async fn summarize(&self, existing: Option<&str>, span: &[Message]) -> String {
        if let Some(generator) = &self.generator {
            let request = build_summarization_request(existing, span, &self.config);
            match generator.generate(request).await {
                Ok(text) if !text.trim().is_empty() => return text,
                Ok(_) => warn!("Summary generator returned empty text; using digest"),
                Err(e) => warn!(error = %e, "Summary generator failed; using digest"),
            }
        }
        fallback_digest(existing, span)
    }
}

/// Stable id for a summary of `span`.
fn summary_id(span: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for msg in span {
        hasher.update(msg.id.as_bytes());
        hasher.update([0u8]);
    }
    let hex = format!("{:x}", hasher.finalize());
    let short: String = hex.chars().take(16).collect();
    format!("summary-{short}")
}

impl CompactionStrategy for ReactiveOverflow {
    fn name(&self) -> &str {
        "reactive_overflow"
    }

    fn compress<'a>(
        &'a self,
        history: Vec<Message>,
        tokenizer: &'a dyn Tokenizer,
        _target_tokens: usize,
    ) -> CompactionFuture<'a> {
        Box::pin(async move {
            let existing = history
                .first()
                .filter(|m| m.is_marker() && !m.is_clear_marker())
                .map(Message::text);
            let body_start = usize::from(existing.is_some());

            let Some(split) = self.split_index(&history, body_start) else {
                debug!("Nothing older than the preserved turns; skipping summary");
                return Ok(history);
            };

            let span = &history[body_start..split];
            let text = self.summarize(existing.as_deref(), span).await;

            let mut marker = Message::summary(text, split).with_id(summary_id(span));
            marker.timestamp = span.iter().rev().find_map(|m| m.timestamp);

            let mut compacted = Vec::with_capacity(history.len() - split + 1);
            compacted.push(marker);
            compacted.extend_from_slice(&history[split..]);

            let before = messages_tokens(tokenizer, &history)?;
            let after = messages_tokens(tokenizer, &compacted)?;
            if after > before {
                debug!(before, after, "Summary would grow the history; keeping it");
                return Ok(history);
            }
            Ok(compacted)
        })
    }
}

// ── Chain ──────────────────────────────────────────────────────────

/// Record of one strategy that ran successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionStep {
    pub strategy: String,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_before: usize,
    pub messages_after: usize,
}

/// A strategy that failed and stopped the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionFailure {
    pub strategy: String,
    pub reason: String,
}

/// Where a summary marker introduced by the chain sits relative to the
/// chain's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryAnchor {
    pub marker_id: String,
    /// Id of the first message the summary did not replace, or `None` if it
    /// replaced everything.
    pub first_retained: Option<String>,
}

/// Result of running a [`CompactionChain`].
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub messages: Vec<Message>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub steps: Vec<CompactionStep>,
    pub failure: Option<CompactionFailure>,
    /// Set when a strategy produced a new summary marker that is still in
    /// `messages`.
    pub summary: Option<SummaryAnchor>,
}

impl CompactionOutcome {
    /// Whether any strategy changed the history.
    pub fn changed(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.tokens_after != s.tokens_before || s.messages_after != s.messages_before)
    }
}

/// A summary marker in `output` that was not in `input`.
fn new_summary_anchor(input: &[Message], output: &[Message]) -> Option<SummaryAnchor> {
    let marker = output
        .iter()
        .find(|m| m.is_marker() && !m.is_clear_marker() && !input.iter().any(|i| i.id == m.id))?;
    let first_retained = marker
        .metadata
        .summarized_through
        .and_then(|k| input.get(k))
        .map(|m| m.id.clone());
    Some(SummaryAnchor {
        marker_id: marker.id.clone(),
        first_retained,
    })
}

/// Ordered list of strategies.
#[derive(Default)]
pub struct CompactionChain {
    strategies: Vec<Box<dyn CompactionStrategy>>,
}

impl std::fmt::Debug for CompactionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}

impl CompactionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: impl CompactionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn push(&mut self, strategy: Box<dyn CompactionStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Run strategies in order until the history fits in `target_tokens`.
    ///
    /// A strategy error stops the remaining strategies and keeps the last
    /// good history. A result with more tokens than its input is discarded.
    /// Tokenizer failures are returned as errors.
    pub async fn run(
        &self,
        history: Vec<Message>,
        tokenizer: &dyn Tokenizer,
        target_tokens: usize,
    ) -> Result<CompactionOutcome, ContextError> {
        let tokens_before = messages_tokens(tokenizer, &history)?;
        let mut current = history;
        let mut tokens = tokens_before;
        let mut steps = Vec::new();
        let mut failure = None;
        let mut summary = None;

        for strategy in &self.strategies {
            if tokens <= target_tokens {
                break;
            }
            let messages_before = current.len();
            match strategy
                .compress(current.clone(), tokenizer, target_tokens)
                .await
            {
                Ok(next) => {
                    let next_tokens = messages_tokens(tokenizer, &next)?;
                    if next_tokens > tokens {
                        warn!(
                            strategy = strategy.name(),
                            before = tokens,
                            after = next_tokens,
                            "Compaction strategy grew the history; discarding its result"
                        );
                        continue;
                    }
                    info!(
                        strategy = strategy.name(),
                        tokens_before = tokens,
                        tokens_after = next_tokens,
                        messages_before,
                        messages_after = next.len(),
                        "Compaction step applied"
                    );
                    steps.push(CompactionStep {
                        strategy: strategy.name().to_string(),
                        tokens_before: tokens,
                        tokens_after: next_tokens,
                        messages_before,
                        messages_after: next.len(),
                    });
                    if let Some(anchor) = new_summary_anchor(&current, &next) {
                        summary = Some(anchor);
                    }
                    current = next;
                    tokens = next_tokens;
                }
                Err(e) if e.is_token_count_failure() => return Err(e),
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "Compaction strategy failed");
                    failure = Some(CompactionFailure {
                        strategy: strategy.name().to_string(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        // A later strategy may have dropped the marker again.
        let summary =
            summary.filter(|a: &SummaryAnchor| current.iter().any(|m| m.id == a.marker_id));

        Ok(CompactionOutcome {
            messages: current,
            tokens_before,
            tokens_after: tokens,
            steps,
            failure,
            summary,
        })
    }
}
