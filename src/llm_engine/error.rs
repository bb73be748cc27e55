//! Error types for the model lifecycle and generation pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors surfaced by the engine, store and runtime adapters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EngineError {
    /// Requested identifier is absent from the catalog
    ModelNotFound(String),
    /// Download or compile of the model failed; the store reverts to unloaded
    LoadFailed(String),
    /// Runtime error mid-generation
    GenerationFailed(String),
    /// A generation session is already running on this engine
    SessionActive,
    /// Runtime backend could not be reached or spawned
    RuntimeUnavailable(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ModelNotFound(id) => write!(f, "Model not found: {}", id),
            EngineError::LoadFailed(msg) => write!(f, "Failed to load model: {}", msg),
            EngineError::GenerationFailed(msg) => write!(f, "Generation failed: {}", msg),
            EngineError::SessionActive => write!(f, "A generation session is already running"),
            EngineError::RuntimeUnavailable(msg) => write!(f, "Runtime unavailable: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}
