//! Token budget estimation: how many input tokens the next provider call
//! will consume.
//!
//! Two modes:
//!
//! - **Heuristic** — tokenize the system prompt, the serialized tool schemas,
//!   and every projected message, then add a fixed overhead fraction for
//!   provider framing.
//! - **Hybrid** — once a provider call has reported real usage, the next
//!   estimate is `last_input + last_output + heuristic(new messages)`. The
//!   previous output becomes part of the next input, so only the messages
//!   appended after the checkpoint need estimating. The checkpoint is taken
//!   after the assistant reply is stored, so that reply is never counted
//!   twice.
//!
//! Placeholder substitution after a checkpoint makes `last_input` overstate
//! the real payload. The estimate is then biased high, which triggers
//! compaction earlier rather than later.

use crate::context::tokens::{Tokenizer, messages_tokens};
use crate::{ContextError, Message, ToolDef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default provider framing overhead (5% of the counted tokens).
pub const DEFAULT_OVERHEAD_FRACTION: f64 = 0.05;

/// Which estimation mode to prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMode {
    /// Always re-estimate the whole projected history.
    Heuristic,
    /// Use recorded provider usage when available.
    #[default]
    Hybrid,
}

/// Ground-truth usage from the most recent provider call.
///
/// All three fields are set together by [`TokenEstimator::record_actual`] and
/// cleared together by [`TokenEstimator::reset_actual`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActualUsage {
    pub last_input: Option<u64>,
    pub last_output: Option<u64>,
    pub checkpoint_message_count: Option<usize>,
}

impl ActualUsage {
    fn known(&self) -> Option<(u64, u64, usize)> {
        Some((
            self.last_input?,
            self.last_output?,
            self.checkpoint_message_count?,
        ))
    }
}

/// Where the estimated tokens come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenBreakdown {
    /// Tokens in the system prompt (heuristic mode only).
    pub system_prompt: usize,
    /// Tokens in the serialized tool definitions (heuristic mode only).
    pub tools: usize,
    /// Tokens in estimated messages: the whole history (heuristic) or only
    /// the messages after the checkpoint (hybrid).
    pub messages: usize,
    /// Framing overhead (heuristic mode only).
    pub overhead: usize,
    /// Recorded input tokens (hybrid mode only).
    pub actual_input: u64,
    /// Recorded output tokens (hybrid mode only).
    pub actual_output: u64,
}

/// Result of a token estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    pub total: usize,
    /// The mode that actually produced this estimate.
    pub mode: EstimationMode,
    pub breakdown: TokenBreakdown,
}

impl TokenEstimate {
    /// Usage as a fraction of `max_tokens` (0.0 to 1.0+).
    pub fn usage_pct(&self, max_tokens: usize) -> f64 {
        if max_tokens > 0 {
            self.total as f64 / max_tokens as f64
        } else {
            1.0
        }
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self, max_tokens: usize) -> String {
        format!(
            "context: ~{} tokens ({:.0}% of {}, {:?})",
            self.total,
            self.usage_pct(max_tokens) * 100.0,
            max_tokens,
            self.mode,
        )
    }
}

/// Estimates the input size of the next provider call.
///
/// # Example
///
/// ```ignore
/// let mut estimator = TokenEstimator::new(Arc::new(ApproxTokenizer::new()));
/// let before = estimator.estimate("You are helpful.", &[], &history, None)?;
///
/// // After the provider answers and the reply is stored:
/// estimator.record_actual(usage.input_tokens, usage.output_tokens, stored_len);
/// ```
#[derive(Clone)]
pub struct TokenEstimator {
    tokenizer: Arc<dyn Tokenizer>,
    mode: EstimationMode,
    overhead_fraction: f64,
    actual: ActualUsage,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator")
            .field("mode", &self.mode)
            .field("overhead_fraction", &self.overhead_fraction)
            .field("actual", &self.actual)
            .finish()
    }
}

impl TokenEstimator {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            mode: EstimationMode::default(),
            overhead_fraction: DEFAULT_OVERHEAD_FRACTION,
            actual: ActualUsage::default(),
        }
    }

    pub fn with_mode(mut self, mode: EstimationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the framing overhead fraction (clamped to `0.0..=1.0`).
    pub fn with_overhead_fraction(mut self, fraction: f64) -> Self {
        self.overhead_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    pub fn mode(&self) -> EstimationMode {
        self.mode
    }

    pub fn actual(&self) -> ActualUsage {
        self.actual
    }

    /// Stored-history length at the last recorded provider call, if known.
    pub fn checkpoint(&self) -> Option<usize> {
        self.actual.known().map(|(_, _, count)| count)
    }

    /// Record ground-truth usage. `message_count` is the stored history
    /// length immediately after the assistant reply was appended.
    pub fn record_actual(&mut self, input: u64, output: u64, message_count: usize) {
        self.actual = ActualUsage {
            last_input: Some(input),
            last_output: Some(output),
            checkpoint_message_count: Some(message_count),
        };
    }

    /// Forget recorded usage; the next estimate is purely heuristic.
    pub fn reset_actual(&mut self) {
        self.actual = ActualUsage::default();
    }

    /// Tokens in a system prompt.
    pub fn system_prompt_tokens(&self, system_prompt: &str) -> Result<usize, ContextError> {
        if system_prompt.is_empty() {
            return Ok(0);
        }
        self.tokenizer.count_tokens(system_prompt)
    }

    fn tool_tokens(&self, tools: &[ToolDef]) -> Result<usize, ContextError> {
        if tools.is_empty() {
            return Ok(0);
        }
        let serialized = serde_json::to_string(tools)?;
        self.tokenizer.count_tokens(&serialized)
    }

    /// Pure heuristic estimate over the whole projected history.
    pub fn heuristic(
        &self,
        system_prompt: &str,
        tools: &[ToolDef],
        history: &[Message],
    ) -> Result<TokenEstimate, ContextError> {
        let system_prompt = self.system_prompt_tokens(system_prompt)?;
        let tools = self.tool_tokens(tools)?;
        let messages = messages_tokens(self.tokenizer.as_ref(), history)?;

        let subtotal = system_prompt + tools + messages;
        let overhead = (subtotal as f64 * self.overhead_fraction).ceil() as usize;

        Ok(TokenEstimate {
            total: subtotal + overhead,
            mode: EstimationMode::Heuristic,
            breakdown: TokenBreakdown {
                system_prompt,
                tools,
                messages,
                overhead,
                ..Default::default()
            },
        })
    }

    /// Estimate the next call.
    ///
    /// `since_checkpoint` holds the stored messages appended after the last
    /// recorded call (already passed through placeholder substitution). The
    /// hybrid path is taken only in hybrid mode, with usage recorded, and
    /// when the caller could supply that tail; otherwise the estimate falls
    /// back to the heuristic over `history`.
    pub fn estimate(
        &self,
        system_prompt: &str,
        tools: &[ToolDef],
        history: &[Message],
        since_checkpoint: Option<&[Message]>,
    ) -> Result<TokenEstimate, ContextError> {
        if self.mode == EstimationMode::Hybrid
            && let Some((input, output, _)) = self.actual.known()
            && let Some(tail) = since_checkpoint
        {
            let messages = messages_tokens(self.tokenizer.as_ref(), tail)?;
            return Ok(TokenEstimate {
                total: input as usize + output as usize + messages,
                mode: EstimationMode::Hybrid,
                breakdown: TokenBreakdown {
                    messages,
                    actual_input: input,
                    actual_output: output,
                    ..Default::default()
                },
            });
        }
        self.heuristic(system_prompt, tools, history)
    }
}
