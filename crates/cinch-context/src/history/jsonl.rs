//! JSON-lines history file.
//!
//! One message per line, in stored order. Writes are kept in memory until
//! [`flush`](HistoryProvider::flush), which rewrites the whole file through a
//! temp file and a rename so readers never see a half-written history.

use crate::history::{HistoryFuture, HistoryProvider, replace_by_id};
use crate::{ContextError, Message};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    messages: Vec<Message>,
    /// Bumped by every mutation.
    generation: u64,
    /// Generation last written to disk.
    flushed: u64,
}

pub struct JsonlHistory {
    path: PathBuf,
    state: Mutex<State>,
    /// Serializes flushes so an older snapshot never replaces a newer file.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlHistory {
    /// Open `path`, loading any messages already in it. A missing file is an
    /// empty history; it is created on the first flush.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let path = path.into();
        let messages = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            parse_lines(&raw)?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), messages = messages.len(), "Opened history file");
        Ok(Self {
            path,
            state: Mutex::new(State {
                messages,
                ..State::default()
            }),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

fn parse_lines(raw: &str) -> Result<Vec<Message>, ContextError> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| ContextError::History(format!("line {}: {e}", n + 1)))
        })
        .collect()
}

impl HistoryProvider for JsonlHistory {
    fn get_history(&self) -> HistoryFuture<'_, Vec<Message>> {
        Box::pin(async move { Ok(self.with_state(|s| s.messages.clone())) })
    }

    fn save_message(&self, message: Message) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                s.messages.push(message);
                s.generation += 1;
            });
            Ok(())
        })
    }

    fn update_message(&self, message: Message) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                replace_by_id(&mut s.messages, message)?;
                s.generation += 1;
                Ok(())
            })
        })
    }

    fn clear_history(&self) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                s.messages.clear();
                s.generation += 1;
            });
            Ok(())
        })
    }

    fn flush(&self) -> HistoryFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let snapshot = self.with_state(|s| {
                (s.generation != s.flushed).then(|| (s.generation, s.messages.clone()))
            });
            let Some((generation, messages)) = snapshot else {
                return Ok(());
            };

            let mut body = String::new();
            for msg in &messages {
                body.push_str(&serde_json::to_string(msg)?);
                body.push('\n');
            }

            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut tmp = self.path.as_os_str().to_owned();
            tmp.push(".tmp");
            let tmp = PathBuf::from(tmp);
            tokio::fs::write(&tmp, body).await?;
            tokio::fs::rename(&tmp, &self.path).await?;

            // Mutations made while writing keep the history dirty.
            self.with_state(|s| s.flushed = generation);
            debug!(path = %self.path.display(), messages = messages.len(), "Flushed history");
            Ok(())
        })
    }
}
