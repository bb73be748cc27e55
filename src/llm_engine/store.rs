//! Model store - owns the single resident-model slot
//!
//! Devices running these models cannot hold two resident at once, so the
//! store is built around one typed slot: `Unloaded`, `Downloading` with a
//! fractional progress, or `Ready`. Loading a different model replaces the
//! resident one. State changes are broadcast over a watch channel so the UI
//! layer can observe download progress and readiness.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::llm_engine::catalog::{self, ModelDescriptor};
use crate::llm_engine::error::EngineError;
use crate::llm_engine::runtime::{InferenceRuntime, LoadProgress, LoadStage, ModelHandle};

/// Observable snapshot of the resident slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Downloading {
        model_id: String,
        /// 0.0–1.0, monotonically non-decreasing within one load episode
        fraction: f32,
        status: String,
    },
    Ready {
        model_id: String,
    },
}

enum Slot {
    Empty,
    Resident {
        id: String,
        handle: Arc<dyn ModelHandle>,
    },
}

/// Guarantees exactly one model is resident at a time and exposes its
/// readiness.
pub struct ModelStore {
    runtime: Arc<dyn InferenceRuntime>,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ModelState>,
}

impl ModelStore {
    pub fn new(runtime: Arc<dyn InferenceRuntime>) -> Self {
        let (state_tx, _) = watch::channel(ModelState::Unloaded);
        Self {
            runtime,
            slot: Mutex::new(Slot::Empty),
            state_tx,
        }
    }

    /// Subscribe to slot state changes (download progress, readiness).
    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state_tx.subscribe()
    }

    /// Current slot state snapshot.
    pub fn state(&self) -> ModelState {
        self.state_tx.borrow().clone()
    }

    /// Resolve `model_id` to a resident handle, loading it if necessary.
    ///
    /// Idempotent fast path: when the same model is already resident this
    /// returns immediately without a second download. Requesting a different
    /// model drops the resident one, resets the published fraction to 0.0
    /// and proceeds as a fresh load.
    pub async fn ensure_loaded(
        &self,
        model_id: &str,
    ) -> Result<Arc<dyn ModelHandle>, EngineError> {
        let mut slot = self.slot.lock().await;

        if let Slot::Resident { id, handle } = &*slot {
            if id == model_id {
                return Ok(handle.clone());
            }
            log::info!("Replacing resident model '{}' with '{}'", id, model_id);
        }

        let descriptor = catalog::find_model(model_id)
            .ok_or_else(|| EngineError::ModelNotFound(model_id.to_string()))?;

        // Drop the old model before fetching the replacement; the slot never
        // holds two models.
        *slot = Slot::Empty;
        self.state_tx.send_replace(ModelState::Downloading {
            model_id: model_id.to_string(),
            fraction: 0.0,
            status: LoadStage::Fetching.to_string(),
        });

        match self.load_with_progress(&descriptor).await {
            Ok(handle) => {
                // Resident only after a 1.0 fraction has been published
                self.state_tx.send_replace(ModelState::Downloading {
                    model_id: model_id.to_string(),
                    fraction: 1.0,
                    status: LoadStage::Ready.to_string(),
                });
                self.state_tx.send_replace(ModelState::Ready {
                    model_id: model_id.to_string(),
                });
                *slot = Slot::Resident {
                    id: model_id.to_string(),
                    handle: handle.clone(),
                };
                log::info!("Model '{}' resident", model_id);
                Ok(handle)
            }
            Err(e) => {
                // Never expose a partial resident state
                *slot = Slot::Empty;
                self.state_tx.send_replace(ModelState::Unloaded);
                log::warn!("Load of '{}' failed: {}", model_id, e);
                Err(e)
            }
        }
    }

    /// Explicitly replace the resident model. Same contract as
    /// [`ensure_loaded`](Self::ensure_loaded); this is the
    /// intention-revealing entry point for a model switch.
    pub async fn switch(&self, model_id: &str) -> Result<(), EngineError> {
        self.ensure_loaded(model_id).await.map(|_| ())
    }

    /// Drop the resident model, returning the slot to `Unloaded`.
    pub async fn unload(&self) {
        let mut slot = self.slot.lock().await;
        if let Slot::Resident { id, .. } = &*slot {
            log::info!("Unloading model '{}'", id);
        }
        *slot = Slot::Empty;
        self.state_tx.send_replace(ModelState::Unloaded);
    }

    async fn load_with_progress(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<Arc<dyn ModelHandle>, EngineError> {
        let state_tx = self.state_tx.clone();
        let model_id = descriptor.id.clone();
        // Clamp so the published fraction never decreases within an episode,
        // whatever the runtime reports.
        let floor = StdMutex::new(0.0f32);
        let on_progress = Box::new(move |progress: LoadProgress| {
            let mut floor = match floor.lock() {
                Ok(f) => f,
                Err(poisoned) => poisoned.into_inner(),
            };
            let fraction = progress.fraction.clamp(*floor, 1.0);
            *floor = fraction;
            state_tx.send_replace(ModelState::Downloading {
                model_id: model_id.clone(),
                fraction,
                status: progress.stage.to_string(),
            });
        });

        self.runtime.load(descriptor, on_progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::runtimes::scripted::ScriptedRuntime;

    #[tokio::test]
    async fn test_idempotent_load() {
        let runtime = Arc::new(ScriptedRuntime::from_pieces(&["a"]));
        let store = ModelStore::new(runtime.clone());

        let first = store.ensure_loaded("llama-3.2-1b-instruct").await.unwrap();
        let second = store.ensure_loaded("llama-3.2-1b-instruct").await.unwrap();

        assert_eq!(runtime.load_count(), 1);
        assert_eq!(first.model_id(), second.model_id());
        assert_eq!(
            store.state(),
            ModelState::Ready {
                model_id: "llama-3.2-1b-instruct".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let runtime = Arc::new(ScriptedRuntime::from_pieces(&["a"]));
        let store = ModelStore::new(runtime);

        let err = store.ensure_loaded("no-such-model").await.unwrap_err();
        assert_eq!(err, EngineError::ModelNotFound("no-such-model".to_string()));
        assert_eq!(store.state(), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_load_failure_reverts_to_unloaded() {
        let runtime = Arc::new(ScriptedRuntime::from_pieces(&["a"]).failing_load("disk full"));
        let store = ModelStore::new(runtime);

        let err = store.ensure_loaded("phi-3.5-mini").await.unwrap_err();
        assert!(matches!(err, EngineError::LoadFailed(_)));
        assert_eq!(store.state(), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_switch_resets_progress() {
        let runtime = Arc::new(ScriptedRuntime::from_pieces(&["a"]));
        let store = Arc::new(ModelStore::new(runtime.clone()));
        store.ensure_loaded("llama-3.2-1b-instruct").await.unwrap();

        let mut rx = store.subscribe();
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                seen.push(rx.borrow().clone());
                if matches!(*rx.borrow(), ModelState::Ready { .. }) {
                    break;
                }
            }
            seen
        });

        store.switch("qwen3-4b").await.unwrap();
        let seen = collector.await.unwrap();

        // The first observable progress for the new model is 0.0, never a
        // stale fraction carried over from the old one.
        let first_downloading = seen
            .iter()
            .find_map(|s| match s {
                ModelState::Downloading {
                    model_id, fraction, ..
                } => Some((model_id.clone(), *fraction)),
                _ => None,
            })
            .expect("no downloading state observed");
        assert_eq!(first_downloading.0, "qwen3-4b");
        assert_eq!(first_downloading.1, 0.0);

        assert_eq!(runtime.load_count(), 2);
        assert_eq!(
            store.state(),
            ModelState::Ready {
                model_id: "qwen3-4b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unload() {
        let runtime = Arc::new(ScriptedRuntime::from_pieces(&["a"]));
        let store = ModelStore::new(runtime);
        store.ensure_loaded("phi-3.5-mini").await.unwrap();
        store.unload().await;
        assert_eq!(store.state(), ModelState::Unloaded);
    }
}
