//! Inference runtime implementations
//!
//! - sidecar.rs: production backend, JSON-RPC to an external inference process
//! - scripted.rs: deterministic in-process backend for tests and demos

pub mod scripted;
pub mod sidecar;

pub use scripted::ScriptedRuntime;
pub use sidecar::{SidecarConfig, SidecarRuntime};
