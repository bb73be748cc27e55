//! Generation session - per-call state for one end-to-end invocation of the
//! pipeline, from prompt assembly to final or streamed text

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm_engine::catalog::ModelKind;
use crate::llm_engine::runtime::Token;
use crate::llm_engine::thinking::{split_thinking, ThinkingSplit};

/// Phase of a generation session. Created in `Running`; exactly one terminal
/// transition happens per session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Ephemeral state for one call to `generate`/`generate_stream`. Owned by
/// the call; never persisted.
pub struct GenerationSession {
    cancel: CancellationToken,
    started_at: Instant,
    phase: SessionPhase,
    tokens: Vec<Token>,
    text: String,
    split: ThinkingSplit,
    thinking_started: Option<Instant>,
    thinking_ended: Option<Instant>,
}

impl GenerationSession {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            started_at: Instant::now(),
            phase: SessionPhase::Running,
            tokens: Vec::new(),
            text: String::new(),
            split: ThinkingSplit::default(),
            thinking_started: None,
            thinking_ended: None,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Append a token batch, clamping to `budget`. Returns true once the
    /// budget is reached.
    pub fn push_tokens(&mut self, mut batch: Vec<Token>, budget: usize) -> bool {
        let remaining = budget.saturating_sub(self.tokens.len());
        if batch.len() > remaining {
            batch.truncate(remaining);
        }
        self.tokens.extend_from_slice(&batch);
        self.tokens.len() >= budget
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Record the latest decoded text and, for reasoning models, recompute
    /// the thinking/answer split and its timing.
    pub fn set_text(&mut self, text: String, kind: ModelKind) {
        self.text = text;
        match kind {
            ModelKind::Reasoning => {
                self.split = split_thinking(&self.text);
                if self.split.thinking.is_some() && self.thinking_started.is_none() {
                    self.thinking_started = Some(Instant::now());
                }
                if self.split.answer.is_some()
                    && self.thinking_started.is_some()
                    && self.thinking_ended.is_none()
                {
                    self.thinking_ended = Some(Instant::now());
                }
            }
            ModelKind::Standard => {
                self.split = ThinkingSplit {
                    thinking: None,
                    answer: if self.text.is_empty() {
                        None
                    } else {
                        Some(self.text.clone())
                    },
                };
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn split(&self) -> &ThinkingSplit {
        &self.split
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Duration spent inside the thinking segment, if one was observed.
    pub fn thinking_time(&self) -> Option<Duration> {
        let started = self.thinking_started?;
        let ended = self.thinking_ended.map(|e| e - started);
        // No closing tag yet: thinking is still accruing
        Some(ended.unwrap_or_else(|| started.elapsed()))
    }

    /// Formatted generation rate, e.g. "12.4 tok/s".
    pub fn tokens_per_second(&self) -> String {
        let secs = self.elapsed().as_secs_f64();
        let rate = if secs > 0.0 {
            self.tokens.len() as f64 / secs
        } else {
            0.0
        };
        format!("{:.1} tok/s", rate)
    }

    pub fn complete(&mut self) {
        debug_assert_eq!(self.phase, SessionPhase::Running);
        self.phase = SessionPhase::Completed;
    }

    pub fn mark_cancelled(&mut self) {
        debug_assert_eq!(self.phase, SessionPhase::Running);
        self.phase = SessionPhase::Cancelled;
    }

    pub fn fail(&mut self) {
        debug_assert_eq!(self.phase, SessionPhase::Running);
        self.phase = SessionPhase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_clamps_batch() {
        let mut session = GenerationSession::new(CancellationToken::new());
        assert!(!session.push_tokens(vec![1, 2, 3], 5));
        // Batch crossing the budget is truncated, not dropped
        assert!(session.push_tokens(vec![4, 5, 6, 7], 5));
        assert_eq!(session.token_count(), 5);
        assert_eq!(session.tokens(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_phase_transitions() {
        let mut session = GenerationSession::new(CancellationToken::new());
        assert_eq!(session.phase(), SessionPhase::Running);
        session.complete();
        assert_eq!(session.phase(), SessionPhase::Completed);
    }

    #[test]
    fn test_reasoning_split_tracked() {
        let mut session = GenerationSession::new(CancellationToken::new());
        session.set_text("<think>hm".to_string(), ModelKind::Reasoning);
        assert!(session.split().is_thinking());
        assert!(session.thinking_time().is_some());

        session.set_text("<think>hm</think>done".to_string(), ModelKind::Reasoning);
        assert!(!session.split().is_thinking());
        assert_eq!(session.split().answer.as_deref(), Some("done"));
    }

    #[test]
    fn test_standard_text_is_all_answer() {
        let mut session = GenerationSession::new(CancellationToken::new());
        session.set_text("<think>not a tag for me".to_string(), ModelKind::Standard);
        assert_eq!(session.split().thinking, None);
        assert_eq!(
            session.split().answer.as_deref(),
            Some("<think>not a tag for me")
        );
    }
}
