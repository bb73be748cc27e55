//! Opaque inference runtime boundary
//!
//! The tensor/inference backend is treated as a capability: given a model
//! descriptor it can fetch/compile the model, and given a prompt it produces
//! a token stream. Tokens are opaque ids; decoded text is reconstructed by
//! the handle from the accumulated token list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::llm_engine::catalog::ModelDescriptor;
use crate::llm_engine::error::EngineError;
use crate::llm_engine::prompt::ChatMessage;

/// Atomic unit of generated output.
pub type Token = u32;

/// Capacity of the token channel between the runtime and the engine.
/// Bounded so a slow consumer applies backpressure to the producer.
pub const TOKEN_CHANNEL_CAPACITY: usize = 32;

/// Receiver half of a generation's token stream. The channel closing without
/// an error means the model signaled natural completion.
pub type TokenReceiver = mpsc::Receiver<Result<Vec<Token>, EngineError>>;

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleParams {
    pub temperature: f32,
    /// Fresh per call so repeated invocations produce distinct output
    pub seed: u64,
}

/// Stage of a model load, for progress display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadStage {
    Fetching,
    Compiling,
    Ready,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Fetching => write!(f, "Downloading model"),
            LoadStage::Compiling => write!(f, "Loading model"),
            LoadStage::Ready => write!(f, "Ready"),
        }
    }
}

/// Fractional progress of a model load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProgress {
    /// 0.0–1.0 across the whole fetch + compile episode
    pub fraction: f32,
    pub stage: LoadStage,
}

/// Callback the store hands to the runtime to observe load progress.
pub type ProgressFn = Box<dyn Fn(LoadProgress) + Send + Sync>;

/// A backend able to fetch/compile models.
#[async_trait]
pub trait InferenceRuntime: Send + Sync {
    /// Fetch and compile `model`, reporting fractional progress as it goes.
    /// On success the returned handle is ready to run inference without
    /// further I/O.
    async fn load(
        &self,
        model: &ModelDescriptor,
        on_progress: ProgressFn,
    ) -> Result<std::sync::Arc<dyn ModelHandle>, EngineError>;
}

/// A resident model.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    fn model_id(&self) -> &str;

    /// Begin one generation. Token batches arrive on the returned channel in
    /// generation order; the channel closes on natural completion. The
    /// runtime stops producing soon after `cancel` fires.
    async fn start(
        &self,
        messages: &[ChatMessage],
        params: &SampleParams,
        cancel: CancellationToken,
    ) -> Result<TokenReceiver, EngineError>;

    /// Decode the accumulated token list to text. Successive calls over a
    /// growing prefix of the same generation yield append-only text.
    async fn decode(&self, tokens: &[Token]) -> Result<String, EngineError>;
}

impl std::fmt::Debug for dyn ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id())
            .finish()
    }
}
