//! Configuration for the [`ContextManager`](super::ContextManager).
//!
//! Everything has a default, so `ContextConfig::default()` is a working
//! setup: hybrid estimation, attachment offloading above 5 KiB, and a
//! compaction chain of reactive-overflow summarization followed by
//! middle-removal and oldest-removal.
//!
//! The config deserializes from JSON, with every field optional:
//!
//! ```json
//! {
//!   "max_input_tokens": 100000,
//!   "estimation": "heuristic",
//!   "compaction": [
//!     { "strategy": "middle_removal", "preserve_head": 2, "preserve_tail": 6 },
//!     { "strategy": "oldest_removal", "min_messages_to_keep": 4 }
//!   ],
//!   "blob_offload": { "enabled": true, "threshold_bytes": 8192 },
//!   "tool_result_compaction": { "keep_recent": 5, "protected_tools": ["todo"] }
//! }
//! ```

use crate::blob::resolver::DEFAULT_OFFLOAD_THRESHOLD_BYTES;
use crate::context::budget::{DEFAULT_OVERHEAD_FRACTION, EstimationMode};
use crate::context::compaction::{
    CompactionChain, CompactionStrategy, MiddleRemoval, NoopCompaction, OldestRemoval,
    ReactiveOverflow,
};
use crate::context::eviction::EvictionConfig;
use crate::context::projection::COMPACTED_PLACEHOLDER;
use crate::context::summarizer::{SummarizerConfig, SummaryGenerator};
use crate::ContextError;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

// ── Generic toggle ────────────────────────────────────────────────

/// Generic enabled/disabled wrapper for module configurations.
///
/// When `enabled` is `false`, the module is skipped regardless of the inner
/// config values. In JSON the inner fields sit next to `enabled`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Toggle<T: Default> {
    pub enabled: bool,
    #[serde(flatten)]
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// Create a disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Blob offload ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Attachments whose estimated size exceeds this are offloaded.
    pub threshold_bytes: usize,
    /// Media types expansion may emit. Overrides the model registry.
    pub allowed_media_types: Option<Vec<String>>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_OFFLOAD_THRESHOLD_BYTES,
            allowed_media_types: None,
        }
    }
}

/// Blob offload configuration.
pub type BlobOffloadConfig = Toggle<BlobConfig>;

// ── Compaction strategies ─────────────────────────────────────────

fn default_min_messages() -> usize {
    OldestRemoval::default().min_messages_to_keep
}

fn default_preserve_head() -> usize {
    MiddleRemoval::default().preserve_head
}

fn default_preserve_tail() -> usize {
    MiddleRemoval::default().preserve_tail
}

fn default_preserve_turns() -> usize {
    2
}

fn default_summary_tokens() -> u32 {
    SummarizerConfig::default().max_summary_tokens
}

/// One entry of the compaction chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CompactionConfig {
    Noop,
    OldestRemoval {
        #[serde(default = "default_min_messages")]
        min_messages_to_keep: usize,
    },
    MiddleRemoval {
        #[serde(default = "default_preserve_head")]
        preserve_head: usize,
        #[serde(default = "default_preserve_tail")]
        preserve_tail: usize,
    },
    ReactiveOverflow {
        #[serde(default = "default_preserve_turns")]
        preserve_last_turns: usize,
        #[serde(default = "default_summary_tokens")]
        max_summary_tokens: u32,
    },
}

impl CompactionConfig {
    /// Build the strategy. `generator` is used by reactive-overflow only.
    pub fn build(&self, generator: Option<Arc<dyn SummaryGenerator>>) -> Box<dyn CompactionStrategy> {
        match *self {
            CompactionConfig::Noop => Box::new(NoopCompaction),
            CompactionConfig::OldestRemoval {
                min_messages_to_keep,
            } => Box::new(OldestRemoval {
                min_messages_to_keep,
            }),
            CompactionConfig::MiddleRemoval {
                preserve_head,
                preserve_tail,
            } => Box::new(MiddleRemoval {
                preserve_head,
                preserve_tail,
            }),
            CompactionConfig::ReactiveOverflow {
                preserve_last_turns,
                max_summary_tokens,
            } => {
                let mut strategy = ReactiveOverflow::new(preserve_last_turns)
                    .with_config(SummarizerConfig { max_summary_tokens });
                if let Some(generator) = generator {
                    strategy = strategy.with_generator(generator);
                }
                Box::new(strategy)
            }
        }
    }
}

/// Build a chain from an ordered list of strategy configs.
pub fn build_chain(
    configs: &[CompactionConfig],
    generator: Option<Arc<dyn SummaryGenerator>>,
) -> CompactionChain {
    let mut chain = CompactionChain::new();
    for config in configs {
        chain.push(config.build(generator.clone()));
    }
    chain
}

fn default_compaction() -> Vec<CompactionConfig> {
    vec![
        CompactionConfig::ReactiveOverflow {
            preserve_last_turns: default_preserve_turns(),
            max_summary_tokens: default_summary_tokens(),
        },
        CompactionConfig::MiddleRemoval {
            preserve_head: default_preserve_head(),
            preserve_tail: default_preserve_tail(),
        },
        CompactionConfig::OldestRemoval {
            min_messages_to_keep: default_min_messages(),
        },
    ]
}

// ── Main config ───────────────────────────────────────────────────

/// Configuration for a [`ContextManager`](super::ContextManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Input budget override. Falls back to the model registry, then to
    /// [`DEFAULT_MAX_INPUT_TOKENS`](crate::registry::DEFAULT_MAX_INPUT_TOKENS).
    pub max_input_tokens: Option<usize>,
    pub estimation: EstimationMode,
    /// Framing overhead added by heuristic estimates.
    pub overhead_fraction: f64,
    /// Strategies run in order when the estimate exceeds the budget.
    pub compaction: Vec<CompactionConfig>,
    pub blob_offload: BlobOffloadConfig,
    /// Selection rules for [`compact_old_tool_results`](super::ContextManager::compact_old_tool_results).
    pub tool_result_compaction: EvictionConfig,
    /// Text shown in place of compacted tool results.
    pub placeholder_text: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_input_tokens: None,
            estimation: EstimationMode::default(),
            overhead_fraction: DEFAULT_OVERHEAD_FRACTION,
            compaction: default_compaction(),
            blob_offload: BlobOffloadConfig::default(),
            tool_result_compaction: EvictionConfig::default(),
            placeholder_text: COMPACTED_PLACEHOLDER.to_string(),
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ContextError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_max_input_tokens(mut self, max: usize) -> Self {
        self.max_input_tokens = Some(max);
        self
    }

    pub fn with_estimation(mut self, mode: EstimationMode) -> Self {
        self.estimation = mode;
        self
    }

    pub fn with_compaction(mut self, compaction: Vec<CompactionConfig>) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_blob_offload(mut self, blob_offload: BlobOffloadConfig) -> Self {
        self.blob_offload = blob_offload;
        self
    }

    /// Restrict the media types blob expansion may emit.
    pub fn with_allowed_media_types(mut self, types: Vec<String>) -> Self {
        self.blob_offload.config.allowed_media_types = Some(types);
        self
    }

    pub fn with_tool_result_compaction(mut self, config: EvictionConfig) -> Self {
        self.tool_result_compaction = config;
        self
    }

    pub fn with_placeholder_text(mut self, text: impl Into<String>) -> Self {
        self.placeholder_text = text.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.estimation, EstimationMode::Hybrid);
        assert!(config.blob_offload.enabled);
        assert_eq!(config.blob_offload.config.threshold_bytes, 5120);
        assert_eq!(config.placeholder_text, "[Old tool result content cleared]");
        assert_eq!(build_chain(&config.compaction, None).len(), 3);
    }

    #[test]
    fn parses_json() {
        let config: ContextConfig = serde_json::from_str(
            r#"{
                "max_input_tokens": 1000,
                "estimation": "heuristic",
                "compaction": [
                    {"strategy": "middle_removal", "preserve_head": 1},
                    {"strategy": "noop"}
                ],
                "blob_offload": {"enabled": false, "allowed_media_types": ["image/*"]}
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_input_tokens, Some(1000));
        assert_eq!(config.estimation, EstimationMode::Heuristic);
        assert_eq!(
            config.compaction[0],
            CompactionConfig::MiddleRemoval {
                preserve_head: 1,
                preserve_tail: 4
            }
        );
        assert!(!config.blob_offload.enabled);
        assert_eq!(config.blob_offload.config.threshold_bytes, 5120);
        assert_eq!(
            config.blob_offload.config.allowed_media_types,
            Some(vec!["image/*".to_string()])
        );

        let chain = build_chain(&config.compaction, None);
        assert_eq!(format!("{chain:?}"), r#"["middle_removal", "noop"]"#);
    }
}
