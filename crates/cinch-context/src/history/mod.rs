//! Message storage.
//!
//! A [`HistoryProvider`] owns the stored, append-only message list of one
//! conversation. The manager never rewrites it wholesale: messages are
//! appended with `save_message` and individual messages are replaced with
//! `update_message` (streaming, compaction flags). `flush` is the only
//! durability barrier.

pub mod jsonl;

use crate::{ContextError, Message};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Boxed future returned by [`HistoryProvider`] methods.
pub type HistoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ContextError>> + Send + 'a>>;

/// Storage for one conversation's messages.
pub trait HistoryProvider: Send + Sync {
    /// Snapshot of all stored messages, oldest first.
    fn get_history(&self) -> HistoryFuture<'_, Vec<Message>>;

    /// Append a message.
    fn save_message(&self, message: Message) -> HistoryFuture<'_, ()>;

    /// Replace the stored message with the same id.
    fn update_message(&self, message: Message) -> HistoryFuture<'_, ()>;

    /// Delete every stored message.
    fn clear_history(&self) -> HistoryFuture<'_, ()>;

    /// Make every previous write durable. No-op for in-memory providers.
    fn flush(&self) -> HistoryFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Replace the message with `message.id` in `messages`.
pub(crate) fn replace_by_id(messages: &mut [Message], message: Message) -> Result<(), ContextError> {
    let slot = messages
        .iter_mut()
        .find(|m| m.id == message.id)
        .ok_or_else(|| ContextError::MessageNotFound {
            id: message.id.clone(),
        })?;
    *slot = message;
    Ok(())
}

/// In-process history.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    messages: Mutex<Vec<Message>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing message list.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }
}

impl HistoryProvider for MemoryHistory {
    fn get_history(&self) -> HistoryFuture<'_, Vec<Message>> {
        Box::pin(async move { Ok(self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()) })
    }

    fn save_message(&self, message: Message) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            self.messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message);
            Ok(())
        })
    }

    fn update_message(&self, message: Message) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
            replace_by_id(&mut messages, message)
        })
    }

    fn clear_history(&self) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            self.messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            Ok(())
        })
    }
}
