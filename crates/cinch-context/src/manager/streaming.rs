//! In-place mutation of in-flight assistant messages.
//!
//! A streamed reply is appended as an empty assistant message in the
//! `streaming` state and filled in as chunks arrive. Every operation reads a
//! fresh snapshot, applies one mutation, and writes the whole message back
//! with `update_message`. Once finalized the message is immutable. A
//! cancelled turn keeps whatever content was already written.

use super::{ContextManager, validate};
use crate::{ContentPart, ContextError, Message, MessageRole, MessageState, TokenUsage, ToolCall};
use tracing::{debug, trace};

/// Shallow update for an in-flight assistant message. `Some` fields replace
/// the stored value; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct AssistantUpdate {
    pub content: Option<Vec<ContentPart>>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub reasoning: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl AssistantUpdate {
    fn apply(self, msg: &mut Message) {
        if let Some(content) = self.content {
            msg.content = Some(content);
        }
        if let Some(tool_calls) = self.tool_calls {
            msg.tool_calls = tool_calls;
        }
        if let Some(reasoning) = self.reasoning {
            msg.reasoning = Some(reasoning);
        }
        if let Some(usage) = self.token_usage {
            msg.token_usage = Some(usage);
        }
    }
}

impl ContextManager {
    /// Find `id` in a fresh snapshot and check that it can still be mutated.
    async fn load_in_flight(&self, id: &str) -> Result<Message, ContextError> {
        let stored = self.history.get_history().await?;
        let msg = stored
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| ContextError::MessageNotFound { id: id.to_string() })?;
        if msg.role != MessageRole::Assistant {
            return Err(ContextError::MessageNotAssistant {
                id: id.to_string(),
                role: msg.role,
            });
        }
        if !msg.is_streaming() {
            return Err(ContextError::MessageFinalized { id: id.to_string() });
        }
        Ok(msg)
    }

    async fn mutate_in_flight(
        &mut self,
        id: &str,
        mutate: impl FnOnce(&mut Message),
    ) -> Result<Message, ContextError> {
        let mut msg = self.load_in_flight(id).await?;
        mutate(&mut msg);
        self.history.update_message(msg.clone()).await?;
        Ok(msg)
    }

    /// Append an empty in-flight assistant message. Returns its id.
    pub async fn begin_assistant_message(&mut self) -> Result<String, ContextError> {
        let mut msg = Message::assistant_tool_calls(Vec::new());
        msg.state = MessageState::Streaming;
        let msg = self.add_message(msg).await?;
        debug!(id = %msg.id, "Began streaming assistant message");
        Ok(msg.id)
    }

    /// Append `text` to the last text part, or start a new text part.
    pub async fn append_assistant_text(
        &mut self,
        id: &str,
        text: &str,
    ) -> Result<Message, ContextError> {
        trace!(id, chars = text.len(), "Appending streamed text");
        self.mutate_in_flight(id, |msg| {
            let parts = msg.content.get_or_insert_with(Vec::new);
            match parts.last_mut() {
                Some(ContentPart::Text { text: last }) => last.push_str(text),
                _ => parts.push(ContentPart::text(text)),
            }
        })
        .await
    }

    pub async fn add_tool_call(
        &mut self,
        id: &str,
        call: ToolCall,
    ) -> Result<Message, ContextError> {
        self.mutate_in_flight(id, |msg| msg.tool_calls.push(call))
            .await
    }

    pub async fn update_assistant_message(
        &mut self,
        id: &str,
        update: AssistantUpdate,
    ) -> Result<Message, ContextError> {
        self.mutate_in_flight(id, |msg| update.apply(msg)).await
    }

    /// Complete the message. It must now satisfy the assistant rules; on
    /// failure it stays in flight. `usage` is stored on the message and
    /// recorded for hybrid estimation.
    pub async fn finalize_assistant_message(
        &mut self,
        id: &str,
        usage: Option<TokenUsage>,
    ) -> Result<Message, ContextError> {
        let mut msg = self.load_in_flight(id).await?;
        msg.state = MessageState::Complete;
        if let Some(usage) = &usage {
            msg.token_usage = Some(usage.clone());
        }
        validate::validate_assistant(&msg)?;

        self.history.update_message(msg.clone()).await?;
        debug!(id, "Finalized assistant message");
        if let Some(usage) = usage {
            self.record_usage(&usage).await?;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::super::LlmContext;
    use super::*;
    use crate::formatter::OpenAiFormatter;
    use crate::history::MemoryHistory;
    use std::sync::Arc;

    fn manager() -> ContextManager {
        ContextManager::new(
            LlmContext::new("openai", "gpt-4o"),
            Arc::new(MemoryHistory::new()),
            Arc::new(OpenAiFormatter),
        )
    }

    #[tokio::test]
    async fn streamed_reply_is_assembled_in_place() {
        let mut mgr = manager();
        mgr.add_user_message(vec![ContentPart::text("list files")])
            .await
            .unwrap();
        let id = mgr.begin_assistant_message().await.unwrap();

        // Empty in-flight messages are not projected.
        let prepared = mgr.prepare_history().await.unwrap();
        assert_eq!(prepared.messages.len(), 1);

        mgr.append_assistant_text(&id, "Let me ").await.unwrap();
        mgr.append_assistant_text(&id, "check.").await.unwrap();
        mgr.add_tool_call(&id, ToolCall::function("c1", "ls", "{}"))
            .await
            .unwrap();
        let msg = mgr
            .finalize_assistant_message(&id, Some(TokenUsage::new(40, 8)))
            .await
            .unwrap();

        assert_eq!(msg.text(), "Let me check.");
        assert_eq!(msg.content.as_ref().map(Vec::len), Some(1));
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(!msg.is_streaming());
        assert_eq!(mgr.usage_snapshot().checkpoint_message_count, Some(2));

        let stored = mgr.get_history().await.unwrap();
        assert_eq!(stored[1], msg);
        assert_eq!(stored[1].provider.as_deref(), Some("openai"));
    }

    #[tokio::test]
    async fn mutation_errors() {
        let mut mgr = manager();
        let user = mgr
            .add_user_message(vec![ContentPart::text("hi")])
            .await
            .unwrap();

        let err = mgr.append_assistant_text("missing", "x").await.unwrap_err();
        assert!(matches!(err, ContextError::MessageNotFound { .. }));

        let err = mgr.append_assistant_text(&user.id, "x").await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::MessageNotAssistant {
                role: MessageRole::User,
                ..
            }
        ));

        let id = mgr.begin_assistant_message().await.unwrap();
        // Nothing to finalize yet: the message stays in flight.
        let err = mgr.finalize_assistant_message(&id, None).await.unwrap_err();
        assert!(matches!(err, ContextError::InvalidContent(_)));

        mgr.update_assistant_message(
            &id,
            AssistantUpdate {
                content: Some(vec![ContentPart::text("done")]),
                reasoning: Some("short".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        mgr.finalize_assistant_message(&id, None).await.unwrap();

        let err = mgr.append_assistant_text(&id, "more").await.unwrap_err();
        assert!(matches!(err, ContextError::MessageFinalized { .. }));
    }
}
