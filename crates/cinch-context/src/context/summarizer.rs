//! Summary generation for reactive-overflow compaction.
//!
//! A summary replaces a span of old messages with one marker. The span and
//! any existing summary are merged in a single request to a pluggable
//! [`SummaryGenerator`], usually a cheap model. When no generator is
//! configured or it fails, [`fallback_digest`] produces a deterministic
//! plain-text digest instead, so compaction still makes progress.

use crate::{ContentPart, ContextError, Message};
use std::future::Future;
use std::pin::Pin;

/// The prompt used for summarization. Instructs the model to produce a concise,
/// factual summary suitable for injecting into a conversation as context.
const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What the user asked for and what was accomplished
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths, identifiers, and tool names mentioned
- What remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise. Every token must earn its place.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Do not simply append: integrate, deduplicate, and update. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Longest excerpt of a single message kept by [`fallback_digest`], in chars.
const DIGEST_EXCERPT_CHARS: usize = 160;

/// Boxed future returned by [`SummaryGenerator::generate`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ContextError>> + Send + 'a>>;

/// Configuration for summary requests.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Maximum tokens for the summarization response.
    pub max_summary_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_summary_tokens: 2048,
        }
    }
}

/// A one-shot summarization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

/// Produces summary text for a [`SummaryRequest`].
///
/// # Example
///
/// ```ignore
/// struct CheapModel { client: MyClient }
///
/// impl SummaryGenerator for CheapModel {
///     fn generate(&self, request: SummaryRequest) -> SummaryFuture<'_> {
///         Box::pin(async move {
///             self.client
///                 .complete(&request.system, &request.user, request.max_tokens)
///                 .await
///                 .map_err(|e| ContextError::Summarization(e.to_string()))
///         })
///     }
/// }
/// ```
pub trait SummaryGenerator: Send + Sync {
    fn generate(&self, request: SummaryRequest) -> SummaryFuture<'_>;
}

/// Closure-based generator.
pub struct FnSummaryGenerator<F>(pub F);

impl<F, Fut> SummaryGenerator for FnSummaryGenerator<F>
where
    F: Fn(SummaryRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ContextError>> + Send + 'static,
{
    fn generate(&self, request: SummaryRequest) -> SummaryFuture<'_> {
        Box::pin((self.0)(request))
    }
}

fn render_message(msg: &Message) -> String {
    let mut parts: Vec<String> = Vec::new();
    for part in msg.content.iter().flatten() {
        match part {
            ContentPart::Text { text } => parts.push(text.clone()),
            ContentPart::Image { .. } => parts.push("[image]".into()),
            ContentPart::File {
                mime_type,
                filename,
                ..
            } => parts.push(format!(
                "[file {} ({mime_type})]",
                filename.as_deref().unwrap_or("unnamed")
            )),
            ContentPart::UiResource { uri, text, .. } => {
                parts.push(text.clone().unwrap_or_else(|| format!("[ui resource {uri}]")))
            }
        }
    }
    for call in &msg.tool_calls {
        parts.push(format!(
            "[tool call {}({})]",
            call.function.name, call.function.arguments
        ));
    }
    if parts.is_empty() {
        "[no content]".into()
    } else {
        parts.join("\n")
    }
}

fn speaker(msg: &Message) -> String {
    match &msg.name {
        Some(name) if msg.role == crate::MessageRole::Tool => format!("tool {name}"),
        _ => msg.role.to_string(),
    }
}

/// Build the request that summarizes `span`, merging `existing` if present.
pub fn build_summarization_request(
    existing: Option<&str>,
    span: &[Message],
    config: &SummarizerConfig,
) -> SummaryRequest {
    let mut content = String::new();

    if let Some(existing) = existing {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(existing);
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }

    // Full content: the summarizer gets maximum context to work with.
    for msg in span {
        content.push_str(&format!("[{}]: {}\n\n", speaker(msg), render_message(msg)));
    }

    SummaryRequest {
        system: SUMMARIZATION_PROMPT.to_string(),
        user: content,
        max_tokens: config.max_summary_tokens,
    }
}

fn excerpt(text: &str) -> String {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if line.chars().count() > DIGEST_EXCERPT_CHARS {
        let cut: String = line.chars().take(DIGEST_EXCERPT_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

/// Deterministic plain-text digest of `span`, used when no generator is
/// available or the generator failed.
pub fn fallback_digest(existing: Option<&str>, span: &[Message]) -> String {
    let mut out = String::new();
    if let Some(existing) = existing {
        out.push_str(existing.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(&format!("Summary of {} earlier messages:\n", span.len()));
    for msg in span {
        out.push_str(&format!("- [{}] {}\n", speaker(msg), excerpt(&render_message(msg))));
    }
    out.trim_end().to_string()
}
