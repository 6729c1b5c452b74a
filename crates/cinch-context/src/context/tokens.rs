//! Token counting.
//!
//! The [`Tokenizer`] trait is the only way the rest of the crate measures
//! text. [`ApproxTokenizer`] is the default: a characters-per-token ratio that
//! needs no model files. Attachments are not tokenized; each image or file
//! part is charged a flat [`ATTACHMENT_TOKEN_ESTIMATE`].

use crate::{ContentPart, ContextError, Message};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Flat token charge for one image or file part.
pub const ATTACHMENT_TOKEN_ESTIMATE: usize = 1_000;

/// Counts tokens in a piece of text.
///
/// Implementations may be a cheap heuristic or a real model tokenizer. A
/// failure must be returned as [`ContextError::TokenCountFailed`]; callers
/// never substitute zero for a failed count.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> Result<usize, ContextError>;
}

/// Character-ratio tokenizer. Rounds up so any non-empty text costs at least
/// one token.
#[derive(Debug, Clone)]
pub struct ApproxTokenizer {
    chars_per_token: f64,
}

impl ApproxTokenizer {
    pub fn new() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    /// Use a calibrated ratio instead of the default.
    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        if ratio > 0.0 {
            self.chars_per_token = ratio;
        }
        self
    }
}

impl Default for ApproxTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ApproxTokenizer {
    fn count_tokens(&self, text: &str) -> Result<usize, ContextError> {
        let chars = text.chars().count();
        Ok((chars as f64 / self.chars_per_token).ceil() as usize)
    }
}

/// Render the part of a message the model reads, for estimation.
fn render_for_estimate(msg: &Message) -> (String, usize) {
    let mut pieces: Vec<&str> = Vec::new();
    let mut attachments = 0;

    for part in msg.content.iter().flatten() {
        match part {
            ContentPart::Text { text } => pieces.push(text),
            ContentPart::Image { .. } | ContentPart::File { .. } => attachments += 1,
            ContentPart::UiResource { text, .. } => {
                if let Some(text) = text {
                    pieces.push(text);
                }
            }
        }
    }

    for call in &msg.tool_calls {
        pieces.push(&call.function.name);
        pieces.push(&call.function.arguments);
    }

    (pieces.join("\n"), attachments)
}

/// Estimated tokens for one message.
pub fn message_tokens(tokenizer: &dyn Tokenizer, msg: &Message) -> Result<usize, ContextError> {
    let (text, attachments) = render_for_estimate(msg);
    let text_tokens = if text.is_empty() {
        0
    } else {
        tokenizer.count_tokens(&text)?
    };
    Ok(text_tokens + attachments * ATTACHMENT_TOKEN_ESTIMATE)
}

/// Estimated tokens for a slice of messages.
pub fn messages_tokens(
    tokenizer: &dyn Tokenizer,
    messages: &[Message],
) -> Result<usize, ContextError> {
    messages
        .iter()
        .map(|m| message_tokens(tokenizer, m))
        .sum()
}

/// Per-message token counts, in order.
pub fn per_message_tokens(
    tokenizer: &dyn Tokenizer,
    messages: &[Message],
) -> Result<Vec<usize>, ContextError> {
    messages
        .iter()
        .map(|m| message_tokens(tokenizer, m))
        .collect()
}
