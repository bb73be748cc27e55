//! Generation engine - drives one inference call against the resident model
//!
//! Exposes a single-shot (await-to-completion) mode and an incremental
//! streaming mode over the same pipeline: ensure the model is loaded,
//! assemble the prompt, drain the runtime's token channel, re-decode the
//! accumulated tokens at every throttling checkpoint, and segment thinking
//! from answer content for reasoning-tagged models. At most one session runs
//! per engine instance; a second call is rejected, not queued.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_stream::try_stream;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::llm_engine::catalog::{self, ModelKind};
use crate::llm_engine::config::EngineConfig;
use crate::llm_engine::emitter::ThrottledEmitter;
use crate::llm_engine::error::EngineError;
use crate::llm_engine::prompt::{self, ChatMessage};
use crate::llm_engine::runtime::{ModelHandle, SampleParams, TokenReceiver, TOKEN_CHANNEL_CAPACITY};
use crate::llm_engine::session::GenerationSession;
use crate::llm_engine::store::ModelStore;

/// Prefix of the textual failure marker single-shot mode embeds in its
/// returned string instead of surfacing an error.
pub const FAILURE_MARKER: &str = "Generation failed: ";

/// Side-channel observable state of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub is_thinking: bool,
    pub elapsed_ms: u64,
    /// Formatted generation rate, e.g. "12.4 tok/s"
    pub tokens_per_second: String,
    /// Time spent inside the thinking segment, if one was observed
    pub thinking_time_ms: Option<u64>,
    pub thinking: Option<String>,
    pub answer: Option<String>,
}

/// The streamed increments of one generation.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Runs on every exit path of a session, including a consumer dropping the
/// stream mid-generation: cancels the session's token so the runtime stops
/// producing, clears the published running/thinking status, and releases
/// the running flag.
struct SessionGuard {
    running: Arc<AtomicBool>,
    status: Arc<StdRwLock<EngineStatus>>,
    cancel: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        match self.status.write() {
            Ok(mut status) => {
                status.running = false;
                status.is_thinking = false;
            }
            Err(poisoned) => {
                let mut status = poisoned.into_inner();
                status.running = false;
                status.is_thinking = false;
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Drives generation sessions against the store's resident model.
///
/// Designed for one caller surface; callers needing concurrent generations
/// use separate engine instances over the same store.
#[derive(Clone)]
pub struct GenerationEngine {
    store: Arc<ModelStore>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    status: Arc<StdRwLock<EngineStatus>>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl GenerationEngine {
    pub fn new(store: Arc<ModelStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<ModelStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(StdRwLock::new(EngineStatus::default())),
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
        }
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    /// Whether a session is currently running on this engine.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest observable snapshot (running flag, rate, thinking split).
    pub fn status(&self) -> EngineStatus {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Request cancellation of the in-flight session, if any. Cooperative:
    /// the session observes it at its next throttling checkpoint, so at most
    /// one interval's worth of tokens is processed afterwards. Clears the
    /// thinking indicator immediately; does not block on the unwind.
    pub fn stop(&self) {
        let token = match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        token.cancel();

        match self.status.write() {
            Ok(mut status) => status.is_thinking = false,
            Err(poisoned) => poisoned.into_inner().is_thinking = false,
        }
        log::info!("Stop requested");
    }

    /// Replace the resident model. Rejected while a session is running; the
    /// caller retries after the session completes or is cancelled.
    pub async fn switch_model(&self, model_id: &str) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::SessionActive);
        }
        self.store.switch(model_id).await
    }

    /// Run one generation to completion and return the final decoded text.
    ///
    /// An empty history is a no-op. A call while another session is running
    /// returns an empty string immediately. Runtime errors are folded into
    /// the returned text as a [`FAILURE_MARKER`]-prefixed message; this call
    /// never surfaces an error to the caller.
    pub async fn generate(
        &self,
        model_id: &str,
        history: &[ChatMessage],
        system_prompt: &str,
    ) -> String {
        if history.is_empty() {
            return String::new();
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("generate() called while a session is running; rejecting");
            return String::new();
        }

        let mut session = GenerationSession::new(self.arm_cancel());
        let _guard = self.session_guard(&session);
        self.publish(&session, true);

        let text = match self
            .run_session(model_id, history, system_prompt, &mut session, None)
            .await
        {
            Ok(()) => {
                if session.cancel_token().is_cancelled() {
                    session.mark_cancelled();
                } else {
                    session.complete();
                }
                session.text().to_string()
            }
            Err(e) => {
                session.fail();
                log::warn!("Generation failed: {}", e);
                format!("{}{}", FAILURE_MARKER, e)
            }
        };

        log::info!(
            "Session finished: {} tokens in {:?} ({})",
            session.token_count(),
            session.elapsed(),
            session.tokens_per_second()
        );
        self.publish(&session, false);
        text
    }

    /// Run one generation as a finite stream of append-only text increments.
    ///
    /// Increments surface at every throttling checkpoint; a final flush
    /// guarantees their concatenation equals the full decoded text. The
    /// stream ends normally on completion, budget exhaustion or
    /// cancellation; a runtime error terminates it with an `Err` item. Same
    /// guards as [`generate`](Self::generate): an empty history or a running
    /// session yields a stream with no items.
    pub fn generate_stream(
        &self,
        model_id: &str,
        history: &[ChatMessage],
        system_prompt: &str,
    ) -> TextStream {
        let engine = self.clone();
        let model_id = model_id.to_string();
        let history = history.to_vec();
        let system_prompt = system_prompt.to_string();

        Box::pin(try_stream! {
            if history.is_empty() {
                return;
            }
            if engine
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                log::warn!("generate_stream() called while a session is running; rejecting");
                return;
            }

            let mut session = GenerationSession::new(engine.arm_cancel());
            let _guard = engine.session_guard(&session);
            engine.publish(&session, true);

            let (tx, mut rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
            let mut finished: Option<Result<(), EngineError>> = None;
            {
                let run = engine.run_session(
                    &model_id,
                    &history,
                    &system_prompt,
                    &mut session,
                    Some(tx),
                );
                tokio::pin!(run);

                // Drive the pipeline and surface increments as they land;
                // the increments channel closes once the pipeline returns
                loop {
                    tokio::select! {
                        outcome = &mut run, if finished.is_none() => {
                            finished = Some(outcome);
                        }
                        increment = rx.recv() => {
                            match increment {
                                Some(text) => yield text,
                                None => break,
                            }
                        }
                    }
                }
            }

            match finished.unwrap_or(Ok(())) {
                Ok(()) => {
                    if session.cancel_token().is_cancelled() {
                        session.mark_cancelled();
                    } else {
                        session.complete();
                    }
                    engine.publish(&session, false);
                }
                Err(e) => {
                    session.fail();
                    engine.publish(&session, false);
                    Err(e)?;
                }
            }
        })
    }

    /// The shared pipeline behind both modes. When `increments` is set,
    /// newly appended text suffixes are pushed into it at each checkpoint.
    async fn run_session(
        &self,
        model_id: &str,
        history: &[ChatMessage],
        system_prompt: &str,
        session: &mut GenerationSession,
        increments: Option<mpsc::Sender<String>>,
    ) -> Result<(), EngineError> {
        let kind = catalog::find_model(model_id)
            .ok_or_else(|| EngineError::ModelNotFound(model_id.to_string()))?
            .kind;
        let handle = self.store.ensure_loaded(model_id).await?;

        let messages = prompt::assemble(history, system_prompt);
        // Fresh seed every call so repeated invocations produce distinct
        // output; nothing is cached across calls
        let params = SampleParams {
            temperature: self.config.temperature,
            seed: rand::random(),
        };
        log::debug!(
            "Starting generation on '{}' ({} messages, seed {})",
            model_id,
            messages.len(),
            params.seed
        );

        let rx = handle
            .start(&messages, &params, session.cancel_token().clone())
            .await?;

        self.drain_tokens(handle, kind, rx, session, increments)
            .await
    }

    async fn drain_tokens(
        &self,
        handle: Arc<dyn ModelHandle>,
        kind: ModelKind,
        mut rx: TokenReceiver,
        session: &mut GenerationSession,
        increments: Option<mpsc::Sender<String>>,
    ) -> Result<(), EngineError> {
        let budget = self.config.token_budget;
        let mut emitter = ThrottledEmitter::new(self.config.emit_interval);
        let mut decoded_at = 0usize;

        loop {
            let batch = tokio::select! {
                biased;
                _ = session.cancel_token().cancelled() => None,
                batch = rx.recv() => batch,
            };
            // Channel closed (natural completion) or cancellation observed
            let Some(batch) = batch else { break };
            let tokens = batch?;

            let budget_hit = session.push_tokens(tokens, budget);
            if emitter.at_checkpoint(session.token_count()) || budget_hit {
                let text = handle.decode(session.tokens()).await?;
                decoded_at = session.token_count();
                session.set_text(text, kind);
                self.publish(session, true);

                if let Some(tx) = &increments {
                    if let Some(suffix) = emitter.appended_suffix(session.text()) {
                        if tx.send(suffix.to_string()).await.is_err() {
                            break;
                        }
                    }
                }

                if session.cancel_token().is_cancelled() {
                    break;
                }
            }
            if budget_hit {
                break;
            }
        }

        // Flush trailing text the throttling policy hadn't surfaced yet, so
        // the final value is always prefix-complete
        if session.token_count() > decoded_at {
            let text = handle.decode(session.tokens()).await?;
            session.set_text(text, kind);
        }
        if let Some(tx) = &increments {
            if let Some(suffix) = emitter.appended_suffix(session.text()) {
                let _ = tx.send(suffix.to_string()).await;
            }
        }

        Ok(())
    }

    fn session_guard(&self, session: &GenerationSession) -> SessionGuard {
        SessionGuard {
            running: self.running.clone(),
            status: self.status.clone(),
            cancel: session.cancel_token().clone(),
        }
    }

    /// Install a fresh cancellation token for the next session.
    fn arm_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut slot) => *slot = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }

    fn publish(&self, session: &GenerationSession, running: bool) {
        let split = session.split();
        let snapshot = EngineStatus {
            running,
            is_thinking: running
                && !session.cancel_token().is_cancelled()
                && split.is_thinking(),
            elapsed_ms: session.elapsed().as_millis() as u64,
            tokens_per_second: session.tokens_per_second(),
            thinking_time_ms: session.thinking_time().map(|d| d.as_millis() as u64),
            thinking: split.thinking.clone(),
            answer: split.answer.clone(),
        };
        match self.status.write() {
            Ok(mut status) => *status = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::runtimes::scripted::ScriptedRuntime;

    fn engine_over(runtime: ScriptedRuntime) -> GenerationEngine {
        GenerationEngine::new(Arc::new(ModelStore::new(Arc::new(runtime))))
    }

    #[tokio::test]
    async fn test_empty_history_is_noop() {
        let runtime = ScriptedRuntime::from_pieces(&["never"]);
        let engine = engine_over(runtime.clone());
        let text = engine.generate("phi-3.5-mini", &[], "system").await;
        assert_eq!(text, "");
        assert_eq!(runtime.load_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_folds_into_marker() {
        let engine = engine_over(ScriptedRuntime::from_pieces(&["x"]));
        let text = engine
            .generate("no-such-model", &[ChatMessage::user("hi")], "")
            .await;
        assert!(text.starts_with(FAILURE_MARKER));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_running_flag_cleared_after_failure() {
        let runtime = ScriptedRuntime::from_pieces(&["x"]).failing_load("boom");
        let engine = engine_over(runtime);
        let text = engine
            .generate("phi-3.5-mini", &[ChatMessage::user("hi")], "")
            .await;
        assert!(text.starts_with(FAILURE_MARKER));
        assert!(!engine.is_running());
        assert!(!engine.status().running);
    }
}
