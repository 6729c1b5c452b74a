//! Append-time validation.
//!
//! Messages are checked as given; nothing is coerced into shape. A failure
//! names the rule that was violated.

use crate::{ContentPart, Message, MessageRole, ValidationError};

/// Role-specific content rules for a single message.
///
/// In-flight assistant messages may be empty; they are checked again when
/// finalized.
pub fn validate_message(msg: &Message) -> Result<(), ValidationError> {
    if msg.metadata.is_summary {
        return Err(ValidationError::MarkerNotAllowed);
    }
    if msg.compacted_at.is_some() && msg.role != MessageRole::Tool {
        return Err(ValidationError::CompactedOnNonTool);
    }

    match msg.role {
        MessageRole::User => validate_user(msg),
        MessageRole::Assistant if msg.is_streaming() => Ok(()),
        MessageRole::Assistant => validate_assistant(msg),
        MessageRole::Tool => validate_tool(msg),
        MessageRole::System => {
            if msg.text().trim().is_empty() {
                Err(ValidationError::EmptySystemMessage)
            } else {
                Ok(())
            }
        }
    }
}

fn validate_user(msg: &Message) -> Result<(), ValidationError> {
    let parts = match &msg.content {
        Some(parts) if !parts.is_empty() => parts,
        _ => return Err(ValidationError::EmptyUserContent),
    };
    let has_payload = parts.iter().any(|p| match p {
        ContentPart::Text { text } => !text.is_empty(),
        ContentPart::Image { .. } | ContentPart::File { .. } => true,
        ContentPart::UiResource { .. } => false,
    });
    if has_payload {
        Ok(())
    } else {
        Err(ValidationError::UserContentWithoutPayload)
    }
}

/// Assistant rules: content or tool calls, and complete tool calls.
pub fn validate_assistant(msg: &Message) -> Result<(), ValidationError> {
    if msg.is_empty() {
        return Err(ValidationError::EmptyAssistantMessage);
    }
    for (index, call) in msg.tool_calls.iter().enumerate() {
        if call.id.is_empty() {
            return Err(ValidationError::ToolCallMissingId { index });
        }
        if call.function.name.is_empty() {
            return Err(ValidationError::ToolCallMissingName { index });
        }
        if call.function.arguments.trim().is_empty() {
            return Err(ValidationError::ToolCallEmptyArguments { index });
        }
    }
    Ok(())
}

fn validate_tool(msg: &Message) -> Result<(), ValidationError> {
    if msg.tool_call_id.as_deref().is_none_or(str::is_empty) {
        return Err(ValidationError::ToolMissingCallId);
    }
    if msg.name.as_deref().is_none_or(str::is_empty) {
        return Err(ValidationError::ToolMissingName);
    }
    if msg.content.is_none() {
        return Err(ValidationError::ToolMissingContent);
    }
    Ok(())
}

/// Rules that depend on what is already stored: unique ids and
/// non-decreasing timestamps.
pub fn validate_against_history(msg: &Message, stored: &[Message]) -> Result<(), ValidationError> {
    if stored.iter().any(|m| m.id == msg.id) {
        return Err(ValidationError::DuplicateId { id: msg.id.clone() });
    }
    if let Some(ts) = msg.timestamp
        && let Some(last) = stored.iter().filter_map(|m| m.timestamp).max()
        && ts < last
    {
        return Err(ValidationError::TimestampRegression);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageState, ToolCall};
    use chrono::{Duration, Utc};

    #[test]
    fn user_messages() {
        assert_eq!(
            validate_message(&Message::user_parts(vec![])),
            Err(ValidationError::EmptyUserContent)
        );
        assert_eq!(
            validate_message(&Message::user("")),
            Err(ValidationError::UserContentWithoutPayload)
        );
        assert!(validate_message(&Message::user("hi")).is_ok());
        assert!(
            validate_message(&Message::user_parts(vec![ContentPart::image(
                "@blob:x",
                "image/png"
            )]))
            .is_ok()
        );
    }

    #[test]
    fn assistant_messages() {
        assert_eq!(
            validate_message(&Message::assistant_tool_calls(vec![])),
            Err(ValidationError::EmptyAssistantMessage)
        );
        assert_eq!(
            validate_message(&Message::assistant_tool_calls(vec![ToolCall::function(
                "c1", "ls", ""
            )])),
            Err(ValidationError::ToolCallEmptyArguments { index: 0 })
        );
        assert_eq!(
            validate_message(&Message::assistant_tool_calls(vec![
                ToolCall::function("c1", "ls", "{}"),
                ToolCall::function("", "ls", "{}"),
            ])),
            Err(ValidationError::ToolCallMissingId { index: 1 })
        );

        let mut streaming = Message::assistant_tool_calls(vec![]);
        streaming.state = MessageState::Streaming;
        assert!(validate_message(&streaming).is_ok());
    }

    #[test]
    fn tool_messages() {
        let mut tool = Message::tool_result("c1", "grep", "out");
        assert!(validate_message(&tool).is_ok());
        tool.name = None;
        assert_eq!(validate_message(&tool), Err(ValidationError::ToolMissingName));
        let mut tool = Message::tool_result("", "grep", "out");
        assert_eq!(validate_message(&tool), Err(ValidationError::ToolMissingCallId));
        tool.tool_call_id = Some("c1".into());
        tool.content = None;
        assert_eq!(validate_message(&tool), Err(ValidationError::ToolMissingContent));
    }

    #[test]
    fn compacted_only_on_tool_messages() {
        let mut msg = Message::user("hi");
        msg.compacted_at = Some(Utc::now());
        assert_eq!(validate_message(&msg), Err(ValidationError::CompactedOnNonTool));
    }

    #[test]
    fn markers_cannot_be_appended() {
        assert_eq!(
            validate_message(&Message::summary("earlier turns", 3)),
            Err(ValidationError::MarkerNotAllowed)
        );
        assert_eq!(
            validate_message(&Message::clear_marker(Utc::now())),
            Err(ValidationError::MarkerNotAllowed)
        );
    }

    #[test]
    fn history_rules() {
        let now = Utc::now();
        let mut first = Message::user("a").with_id("1");
        first.timestamp = Some(now);
        let stored = vec![first];

        let dup = Message::user("b").with_id("1");
        assert!(matches!(
            validate_against_history(&dup, &stored),
            Err(ValidationError::DuplicateId { .. })
        ));

        let mut older = Message::user("b").with_id("2");
        older.timestamp = Some(now - Duration::seconds(5));
        assert_eq!(
            validate_against_history(&older, &stored),
            Err(ValidationError::TimestampRegression)
        );

        let mut same = Message::user("b").with_id("2");
        same.timestamp = Some(now);
        assert!(validate_against_history(&same, &stored).is_ok());
    }
}
