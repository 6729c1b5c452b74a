//! Context window management: token counting, budgets, compaction, and the
//! read projection.
//!
//! The context window is the scarcest resource in any LLM conversation. This
//! module provides the pieces the [`ContextManager`](crate::manager::ContextManager)
//! combines on every read:
//!
//! 1. **[`tokens`]** — the [`Tokenizer`] trait and a character-ratio default.
//!
//! 2. **[`budget`]** — [`TokenEstimator`] estimates the next call, either from
//!    scratch (heuristic) or from the last provider-reported usage (hybrid).
//!
//! 3. **[`projection`]** — marker filtering and placeholder substitution. Pure
//!    and idempotent; storage is never rewritten.
//!
//! 4. **[`compaction`]** — [`CompactionStrategy`] implementations and the
//!    [`CompactionChain`] that runs them when the estimate exceeds the model's
//!    input budget.
//!
//! 5. **[`eviction`]** — flags old tool results as compacted. No LLM call
//!    needed, typically the highest-ROI context recovery.
//!
//! 6. **[`summarizer`]** — summary requests and the deterministic digest used
//!    by reactive-overflow compaction.

pub mod budget;
pub mod compaction;
pub mod eviction;
pub mod projection;
pub mod summarizer;
pub mod tokens;

// Re-export commonly used items at the module level.
pub use budget::{EstimationMode, TokenEstimate, TokenEstimator};
pub use compaction::{CompactionChain, CompactionOutcome, CompactionStrategy};
pub use projection::{COMPACTED_PLACEHOLDER, ProjectionStats};
pub use tokens::{ApproxTokenizer, DEFAULT_CHARS_PER_TOKEN, Tokenizer};
