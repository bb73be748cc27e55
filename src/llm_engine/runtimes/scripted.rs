//! Scripted in-process runtime
//!
//! Deterministic [`InferenceRuntime`] used by the test suite and for offline
//! demos: a fixed vocabulary, a scripted token sequence, optional endless
//! emission, and injectable load/generation failures. Records load counts
//! and per-call seeds so tests can assert lifecycle behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::llm_engine::catalog::ModelDescriptor;
use crate::llm_engine::error::EngineError;
use crate::llm_engine::prompt::ChatMessage;
use crate::llm_engine::runtime::{
    InferenceRuntime, LoadProgress, LoadStage, ModelHandle, ProgressFn, SampleParams, Token,
    TokenReceiver, TOKEN_CHANNEL_CAPACITY,
};

struct Inner {
    vocab: Vec<String>,
    script: Vec<Token>,
    /// After the script is exhausted, keep emitting this token forever
    endless: Option<Token>,
    batch_size: usize,
    /// Token channel capacity; 1 keeps the producer in lockstep with the
    /// consumer, which latency-bound tests rely on
    channel_capacity: usize,
    fail_load: Option<String>,
    /// Emit an error once this many tokens have been produced
    fail_after: Option<(usize, String)>,
    load_steps: Vec<f32>,
    load_count: AtomicUsize,
    seeds: Mutex<Vec<u64>>,
}

/// Deterministic runtime whose "model" plays back a scripted token sequence.
#[derive(Clone)]
pub struct ScriptedRuntime {
    inner: Arc<Inner>,
}

impl ScriptedRuntime {
    /// A runtime whose script emits `pieces` in order, one token per piece.
    pub fn from_pieces(pieces: &[&str]) -> Self {
        Self {
            inner: Arc::new(Inner {
                vocab: pieces.iter().map(|p| p.to_string()).collect(),
                script: (0..pieces.len() as Token).collect(),
                endless: None,
                batch_size: 1,
                channel_capacity: TOKEN_CHANNEL_CAPACITY,
                fail_load: None,
                fail_after: None,
                load_steps: vec![0.25, 0.5, 0.75],
                load_count: AtomicUsize::new(0),
                seeds: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A runtime that never signals natural completion: it repeats `piece`
    /// until cancelled or the consumer stops draining.
    pub fn endless(piece: &str) -> Self {
        let mut runtime = Self::from_pieces(&[piece]);
        {
            let inner = Arc::get_mut(&mut runtime.inner).unwrap();
            inner.script.clear();
            inner.endless = Some(0);
        }
        runtime
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        Arc::get_mut(&mut self.inner).unwrap().batch_size = batch_size.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        Arc::get_mut(&mut self.inner).unwrap().channel_capacity = capacity.max(1);
        self
    }

    /// Make every load fail with `msg`.
    pub fn failing_load(mut self, msg: &str) -> Self {
        Arc::get_mut(&mut self.inner).unwrap().fail_load = Some(msg.to_string());
        self
    }

    /// Make generation emit an error after `tokens` tokens.
    pub fn failing_after(mut self, tokens: usize, msg: &str) -> Self {
        Arc::get_mut(&mut self.inner).unwrap().fail_after = Some((tokens, msg.to_string()));
        self
    }

    /// How many loads the runtime has performed.
    pub fn load_count(&self) -> usize {
        self.inner.load_count.load(Ordering::SeqCst)
    }

    /// Seeds observed across generation calls, in order.
    pub fn seeds(&self) -> Vec<u64> {
        match self.inner.seeds.lock() {
            Ok(seeds) => seeds.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl InferenceRuntime for ScriptedRuntime {
    async fn load(
        &self,
        model: &ModelDescriptor,
        on_progress: ProgressFn,
    ) -> Result<Arc<dyn ModelHandle>, EngineError> {
        self.inner.load_count.fetch_add(1, Ordering::SeqCst);

        for fraction in &self.inner.load_steps {
            // Small pause so progress subscribers can observe each step
            tokio::time::sleep(Duration::from_millis(1)).await;
            on_progress(LoadProgress {
                fraction: *fraction,
                stage: LoadStage::Fetching,
            });
        }

        if let Some(msg) = &self.inner.fail_load {
            return Err(EngineError::LoadFailed(msg.clone()));
        }

        on_progress(LoadProgress {
            fraction: 1.0,
            stage: LoadStage::Ready,
        });

        Ok(Arc::new(ScriptedHandle {
            model_id: model.id.clone(),
            inner: self.inner.clone(),
        }))
    }
}

struct ScriptedHandle {
    model_id: String,
    inner: Arc<Inner>,
}

impl Inner {
    fn token_at(&self, index: usize) -> Option<Token> {
        self.script.get(index).copied().or(self.endless)
    }
}

#[async_trait]
impl ModelHandle for ScriptedHandle {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn start(
        &self,
        _messages: &[ChatMessage],
        params: &SampleParams,
        cancel: CancellationToken,
    ) -> Result<TokenReceiver, EngineError> {
        match self.inner.seeds.lock() {
            Ok(mut seeds) => seeds.push(params.seed),
            Err(poisoned) => poisoned.into_inner().push(params.seed),
        }

        let (tx, rx) = mpsc::channel(self.inner.channel_capacity);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut emitted = 0usize;
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let mut batch = Vec::with_capacity(inner.batch_size);
                while batch.len() < inner.batch_size {
                    match inner.token_at(emitted + batch.len()) {
                        Some(token) => batch.push(token),
                        None => break,
                    }
                }
                if batch.is_empty() {
                    // Script exhausted: natural completion
                    break;
                }

                emitted += batch.len();
                if tx.send(Ok(batch)).await.is_err() {
                    break;
                }

                if let Some((fail_at, msg)) = &inner.fail_after {
                    if emitted >= *fail_at {
                        let _ = tx
                            .send(Err(EngineError::GenerationFailed(msg.clone())))
                            .await;
                        break;
                    }
                }

                tokio::task::yield_now().await;
            }
        });

        Ok(rx)
    }

    async fn decode(&self, tokens: &[Token]) -> Result<String, EngineError> {
        let mut text = String::new();
        for token in tokens {
            match self.inner.vocab.get(*token as usize) {
                Some(piece) => text.push_str(piece),
                None => {
                    return Err(EngineError::GenerationFailed(format!(
                        "Unknown token id {}",
                        token
                    )))
                }
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::catalog;

    #[tokio::test]
    async fn test_script_plays_back_and_completes() {
        let runtime = ScriptedRuntime::from_pieces(&["Hello", " ", "world"]);
        let handle = runtime
            .load(
                &catalog::find_model("phi-3.5-mini").unwrap(),
                Box::new(|_| {}),
            )
            .await
            .unwrap();

        let params = SampleParams {
            temperature: 0.7,
            seed: 42,
        };
        let mut rx = handle
            .start(&[ChatMessage::user("hi")], &params, CancellationToken::new())
            .await
            .unwrap();

        let mut tokens = Vec::new();
        while let Some(batch) = rx.recv().await {
            tokens.extend(batch.unwrap());
        }
        assert_eq!(tokens, vec![0, 1, 2]);
        assert_eq!(handle.decode(&tokens).await.unwrap(), "Hello world");
        assert_eq!(runtime.seeds(), vec![42]);
    }

    #[tokio::test]
    async fn test_cancel_stops_endless_producer() {
        let runtime = ScriptedRuntime::endless("x");
        let handle = runtime
            .load(
                &catalog::find_model("phi-3.5-mini").unwrap(),
                Box::new(|_| {}),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let params = SampleParams {
            temperature: 0.7,
            seed: 1,
        };
        let mut rx = handle
            .start(&[ChatMessage::user("hi")], &params, cancel.clone())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, vec![0]);

        cancel.cancel();
        // Drain whatever was in flight; the channel must close
        while rx.recv().await.is_some() {}
    }
}
