//! Mark-as-compacted: flag old tool results so the read projection shows a
//! placeholder instead of their content.
//!
//! Tool results are the largest context consumer in an agent loop. A
//! `read_file` can inject 30KB; a `grep` can return hundreds of lines. Most
//! of it is irrelevant once the model has processed it. Marking them frees
//! context without any LLM call, and storage keeps the original so the
//! marking is reversible.

use crate::context::tokens::{Tokenizer, message_tokens, messages_tokens};
use crate::{ContextError, Message, MessageRole};
use serde::Deserialize;
use std::collections::HashSet;

/// Configuration for tool result compaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Tools whose results are never compacted (e.g. tools with ephemeral output).
    pub protected_tools: HashSet<String>,
    /// Number of most recent tool results that always stay visible.
    pub keep_recent: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            protected_tools: HashSet::new(),
            keep_recent: 3,
        }
    }
}

impl EvictionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a protected tool name (its results will never be compacted).
    pub fn protect_tool(mut self, name: impl Into<String>) -> Self {
        self.protected_tools.insert(name.into());
        self
    }

    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    fn is_protected(&self, msg: &Message) -> bool {
        msg.name
            .as_deref()
            .is_some_and(|name| self.protected_tools.contains(name))
    }
}

/// Ids of the tool results that may be compacted, oldest first.
///
/// Skips results that are already compacted, belong to a protected tool, or
/// are among the `keep_recent` most recent tool results. With a
/// `target_tokens`, selection stops as soon as the estimated tokens of
/// `messages` would drop to the target once the selected results are
/// replaced by `placeholder`.
pub fn select_compactable_tool_results(
    messages: &[Message],
    tokenizer: &dyn Tokenizer,
    config: &EvictionConfig,
    placeholder: &str,
    target_tokens: Option<usize>,
) -> Result<Vec<String>, ContextError> {
    let tool_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::Tool)
        .map(|(i, _)| i)
        .collect();
    let eligible = tool_indices.len().saturating_sub(config.keep_recent);

    let mut current = match target_tokens {
        Some(_) => messages_tokens(tokenizer, messages)?,
        None => 0,
    };
    let placeholder_tokens = tokenizer.count_tokens(placeholder)?;

    let mut selected = Vec::new();
    for &idx in &tool_indices[..eligible] {
        if let Some(target) = target_tokens
            && current <= target
        {
            break;
        }
        let msg = &messages[idx];
        if msg.compacted_at.is_some() || config.is_protected(msg) {
            continue;
        }
        if target_tokens.is_some() {
            let tokens = message_tokens(tokenizer, msg)?;
            current = current.saturating_sub(tokens.saturating_sub(placeholder_tokens));
        }
        selected.push(msg.id.clone());
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::projection::COMPACTED_PLACEHOLDER;
    use crate::context::tokens::ApproxTokenizer;
    use chrono::Utc;

    fn tool(id: &str, name: &str, len: usize) -> Message {
        Message::tool_result(format!("call-{id}"), name, "a".repeat(len)).with_id(id)
    }

    fn history() -> Vec<Message> {
        vec![
            Message::user("task").with_id("u"),
            tool("t1", "read_file", 10_000),
            tool("t2", "grep", 10_000),
            tool("t3", "read_file", 10_000),
            tool("t4", "read_file", 10_000),
        ]
    }

    #[test]
    fn keeps_most_recent_results() {
        let config = EvictionConfig::new().with_keep_recent(2);
        let ids = select_compactable_tool_results(
            &history(),
            &ApproxTokenizer::new(),
            &config,
            COMPACTED_PLACEHOLDER,
            None,
        )
        .unwrap();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn protected_and_already_compacted_are_skipped() {
        let mut messages = history();
        messages[1].compacted_at = Some(Utc::now());
        let config = EvictionConfig::new().with_keep_recent(1).protect_tool("grep");
        let ids = select_compactable_tool_results(
            &messages,
            &ApproxTokenizer::new(),
            &config,
            COMPACTED_PLACEHOLDER,
            None,
        )
        .unwrap();
        assert_eq!(ids, vec!["t3"]);
    }

    #[test]
    fn target_stops_selection_early() {
        let tokenizer = ApproxTokenizer::new().with_chars_per_token(1.0);
        let config = EvictionConfig::new().with_keep_recent(0);
        // 40_004 tokens; freeing one result brings it near 30_000.
        let ids = select_compactable_tool_results(
            &history(),
            &tokenizer,
            &config,
            COMPACTED_PLACEHOLDER,
            Some(31_000),
        )
        .unwrap();
        assert_eq!(ids, vec!["t1"]);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EvictionConfig =
            serde_json::from_str(r#"{"protected_tools": ["todo"]}"#).unwrap();
        assert_eq!(config.keep_recent, 3);
        assert!(config.protected_tools.contains("todo"));
    }
}
