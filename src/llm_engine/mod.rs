//! Model lifecycle and generation pipeline
//!
//! The core of the app: loads a local language model into the single
//! resident slot, streams its output token-by-token with cooperative
//! cancellation, and segments reasoning ("thinking") content from answer
//! content for models that emit it.
//!
//! Module structure:
//! - catalog.rs: curated model registry and behavioral tags
//! - store.rs: single-resident-slot lifecycle state machine
//! - downloader.rs: GGUF download with fractional progress
//! - prompt.rs: role-tagged message assembly
//! - runtime.rs: opaque inference-backend boundary
//! - session.rs: per-call generation session
//! - emitter.rs: partial-text throttling policy
//! - thinking.rs: thinking/answer segmentation
//! - engine.rs: the generation engine itself
//! - runtimes/: backend implementations

pub mod catalog;
pub mod config;
pub mod downloader;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod prompt;
pub mod runtime;
pub mod runtimes;
pub mod session;
pub mod store;
pub mod thinking;

pub use catalog::{available_models, find_model, ModelDescriptor, ModelKind};
pub use config::EngineConfig;
pub use engine::{EngineStatus, GenerationEngine, TextStream, FAILURE_MARKER};
pub use error::EngineError;
pub use prompt::{assemble, ChatMessage, Role};
pub use runtime::{InferenceRuntime, LoadProgress, LoadStage, ModelHandle, SampleParams, Token};
pub use session::{GenerationSession, SessionPhase};
pub use store::{ModelState, ModelStore};
pub use thinking::{split_thinking, ThinkingSplit};
