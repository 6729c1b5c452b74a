//! Read-time projection of stored history.
//!
//! Storage keeps every message ever appended. What the model sees is a
//! projection of it:
//!
//! 1. [`filter_compacted`] — only messages at or after the most recent
//!    marker. A clear marker hides everything before it (and itself). A
//!    summary marker stands in for the stored messages it summarized; the
//!    ones it did not summarize stay visible after it.
//! 2. [`substitute_placeholders`] — tool results flagged with `compacted_at`
//!    have their content replaced by a fixed placeholder. Storage keeps the
//!    original.
//!
//! Both steps are pure and idempotent.

use crate::{ContentPart, Message, MessageRole};
use serde::Serialize;

/// Placeholder shown instead of a compacted tool result.
pub const COMPACTED_PLACEHOLDER: &str = "[Old tool result content cleared]";

/// Counts from one projection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionStats {
    /// Messages in storage.
    pub stored: usize,
    /// Messages hidden by the most recent marker.
    pub filtered_out: usize,
    /// In-flight assistant messages skipped because they are still empty.
    pub skipped_in_flight: usize,
    /// Tool results shown as placeholders.
    pub placeholders: usize,
}

fn is_empty_in_flight(msg: &Message) -> bool {
    msg.role == MessageRole::Assistant && msg.is_streaming() && msg.is_empty()
}

/// Drop every message before the most recent marker.
///
/// For a summary marker at index `s` with `summarized_through = k` and
/// `k <= s`, the result is `[marker] ++ history[k..s] ++ history[s+1..]`;
/// other markers in the re-admitted range are dropped. A clear marker yields
/// `history[s+1..]`. Empty in-flight assistant messages are skipped.
pub fn filter_compacted(history: &[Message]) -> Vec<Message> {
    let window: Vec<Message> = match history.iter().rposition(Message::is_marker) {
        None => history.to_vec(),
        Some(idx) => {
            let marker = &history[idx];
            let after = &history[idx + 1..];
            if marker.is_clear_marker() {
                after.to_vec()
            } else {
                let mut out = Vec::with_capacity(history.len() - idx);
                out.push(marker.clone());
                if let Some(k) = marker.metadata.summarized_through
                    && k <= idx
                {
                    out.extend(history[k..idx].iter().filter(|m| !m.is_marker()).cloned());
                }
                out.extend(after.iter().cloned());
                out
            }
        }
    };

    window
        .into_iter()
        .filter(|m| !is_empty_in_flight(m))
        .collect()
}

/// Replace the content of compacted tool results with `placeholder`.
///
/// Returns the substituted history and how many messages were replaced.
pub fn substitute_placeholders(
    mut history: Vec<Message>,
    placeholder: &str,
) -> (Vec<Message>, usize) {
    let mut replaced = 0;
    for msg in history.iter_mut() {
        if msg.role == MessageRole::Tool && msg.compacted_at.is_some() {
            msg.content = Some(vec![ContentPart::text(placeholder)]);
            replaced += 1;
        }
    }
    (history, replaced)
}

/// Run both projection steps over stored history.
pub fn project(stored: &[Message], placeholder: &str) -> (Vec<Message>, ProjectionStats) {
    let window = filter_compacted(stored);
    let skipped_in_flight = stored.iter().filter(|m| is_empty_in_flight(m)).count();
    let filtered = window.len();
    let (projected, placeholders) = substitute_placeholders(window, placeholder);

    let stats = ProjectionStats {
        stored: stored.len(),
        filtered_out: stored.len().saturating_sub(filtered),
        skipped_in_flight,
        placeholders,
    };
    (projected, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageState;
    use chrono::Utc;

    fn numbered(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::user(format!("msg {i}")).with_id(format!("m{i}")))
            .collect()
    }

    fn ids(history: &[Message]) -> Vec<&str> {
        history.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn no_marker_keeps_everything() {
        let history = numbered(3);
        assert_eq!(filter_compacted(&history), history);
    }

    #[test]
    fn clear_marker_hides_everything_before_it() {
        let mut history = numbered(4);
        history.push(Message::clear_marker(Utc::now()).with_id("clear"));
        assert!(filter_compacted(&history).is_empty());

        history.push(Message::user("after").with_id("a1"));
        assert_eq!(ids(&filter_compacted(&history)), vec!["a1"]);
    }

    #[test]
    fn summary_marker_readmits_unsummarized_messages() {
        let mut history = numbered(6);
        // Summary of m0..m3 stored at the end; m4 and m5 stay visible.
        history.push(Message::summary("summary", 4).with_id("s"));
        history.push(Message::user("next").with_id("n"));

        let filtered = filter_compacted(&history);
        assert_eq!(ids(&filtered), vec!["s", "m4", "m5", "n"]);
    }

    #[test]
    fn summary_without_count_starts_window_at_marker() {
        let mut history = numbered(3);
        let mut marker = Message::summary("summary", 0).with_id("s");
        marker.metadata.summarized_through = None;
        history.push(marker);
        history.push(Message::user("tail").with_id("t"));
        assert_eq!(ids(&filter_compacted(&history)), vec!["s", "t"]);
    }

    #[test]
    fn filter_is_idempotent() {
        let mut history = numbered(5);
        history.push(Message::summary("first", 2).with_id("s1"));
        history.extend(numbered(2).into_iter().map(|m| {
            let id = format!("x{}", m.id);
            m.with_id(id)
        }));
        history.push(Message::summary("second", 5).with_id("s2"));
        history.push(Message::user("tail").with_id("t"));

        let once = filter_compacted(&history);
        let twice = filter_compacted(&once);
        assert_eq!(once, twice);
        // The re-admitted range skips the older marker.
        assert!(!once.iter().any(|m| m.id == "s1"));
    }

    #[test]
    fn empty_in_flight_messages_are_skipped() {
        let mut streaming = Message::assistant_tool_calls(vec![]).with_id("live");
        streaming.state = MessageState::Streaming;
        let history = vec![Message::user("q").with_id("q"), streaming];
        let (projected, stats) = project(&history, COMPACTED_PLACEHOLDER);
        assert_eq!(ids(&projected), vec!["q"]);
        assert_eq!(stats.skipped_in_flight, 1);
    }

    #[test]
    fn placeholders_replace_content_only_in_projection() {
        let mut tool = Message::tool_result("c1", "read_file", "x".repeat(500)).with_id("t");
        tool.compacted_at = Some(Utc::now());
        let stored = vec![Message::user("q").with_id("q"), tool];

        let (projected, stats) = project(&stored, COMPACTED_PLACEHOLDER);
        assert_eq!(stats.placeholders, 1);
        assert_eq!(projected[1].text(), COMPACTED_PLACEHOLDER);
        assert_eq!(stored[1].text().len(), 500);
    }

    #[test]
    fn stats_count_filtered_messages() {
        let mut stored = numbered(3);
        stored.push(Message::clear_marker(Utc::now()).with_id("c"));
        stored.push(Message::user("x").with_id("x"));
        let (_, stats) = project(&stored, COMPACTED_PLACEHOLDER);
        assert_eq!(stats.stored, 5);
        assert_eq!(stats.filtered_out, 4);
    }
}
