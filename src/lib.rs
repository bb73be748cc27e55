//! localchat - on-device chat core
//!
//! Everything outside the model lifecycle and generation pipeline (UI,
//! chat-thread persistence, reminders, notifications) lives in the app
//! layers above this crate; they feed a system prompt and a conversation
//! history in and consume the streamed or final text coming out.

pub mod llm_engine;

pub use llm_engine::{
    available_models, find_model, ChatMessage, EngineConfig, EngineError, EngineStatus,
    GenerationEngine, ModelDescriptor, ModelKind, ModelState, ModelStore, Role,
};
