//! Engine configuration

use serde::{Deserialize, Serialize};

/// Tunables for a [`GenerationEngine`](crate::llm_engine::GenerationEngine).
///
/// The defaults match what the app ships with; callers normally use
/// `EngineConfig::default()` and override nothing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard ceiling on tokens emitted per session. Generation halts
    /// deterministically at this count regardless of model behavior.
    pub token_budget: usize,
    /// Number of tokens between successive partial-text decodes/emissions.
    /// Decoding the accumulated text on every single token is measurably
    /// (~15%) more expensive than batching.
    pub emit_interval: usize,
    /// Sampling temperature passed through to the runtime.
    pub temperature: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_budget: 4096,
            emit_interval: 4,
            temperature: 0.7,
        }
    }
}
