//! Model capabilities: input budgets and accepted attachment types.
//!
//! The manager asks a [`ModelRegistry`] for the active model's input token
//! budget (unless configured explicitly) and for the media types blob
//! expansion may emit. [`BuiltinModelRegistry`] matches on model names and
//! does not need to be exact: an unknown model gets a conservative default.

/// Input budget used when nothing else is known.
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 128_000;

/// Capabilities of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub max_input_tokens: usize,
    pub allowed_media_types: Vec<String>,
}

/// Lookup of model capabilities by provider and model name.
pub trait ModelRegistry: Send + Sync {
    /// Media type patterns (`image/*`, `application/pdf`) the model accepts.
    fn allowed_media_types(&self, provider: &str, model: &str) -> Vec<String>;

    /// Maximum input tokens, if known.
    fn max_input_tokens(&self, provider: &str, model: &str) -> Option<usize>;
}

/// Name-matched table of well-known models.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinModelRegistry;

fn types(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| (*p).to_string()).collect()
}

/// Capabilities for `model`. The provider prefix (`anthropic/…`) is ignored.
pub fn capabilities_for_model(model: &str) -> ModelCapabilities {
    // Extract the model name after the last `/` (e.g. "claude-sonnet-4"
    // from "anthropic/claude-sonnet-4").
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.contains("claude") {
        ModelCapabilities {
            max_input_tokens: 200_000,
            allowed_media_types: types(&["image/*", "application/pdf"]),
        }
    } else if name.contains("gpt-4.1") {
        ModelCapabilities {
            max_input_tokens: 1_000_000,
            allowed_media_types: types(&["image/*"]),
        }
    } else if name.contains("gpt-4o") || name.starts_with("o1") || name.starts_with("o3") {
        ModelCapabilities {
            max_input_tokens: 128_000,
            allowed_media_types: types(&["image/*", "application/pdf"]),
        }
    } else if name.contains("gpt-3.5") {
        ModelCapabilities {
            max_input_tokens: 16_000,
            allowed_media_types: Vec::new(),
        }
    } else if name.contains("gemini") {
        ModelCapabilities {
            max_input_tokens: 1_000_000,
            allowed_media_types: types(&["image/*", "audio/*", "video/*", "application/pdf"]),
        }
    } else {
        ModelCapabilities {
            max_input_tokens: DEFAULT_MAX_INPUT_TOKENS,
            allowed_media_types: types(&["image/*"]),
        }
    }
}

impl ModelRegistry for BuiltinModelRegistry {
    fn allowed_media_types(&self, _provider: &str, model: &str) -> Vec<String> {
        capabilities_for_model(model).allowed_media_types
    }

    fn max_input_tokens(&self, _provider: &str, model: &str) -> Option<usize> {
        Some(capabilities_for_model(model).max_input_tokens)
    }
}
