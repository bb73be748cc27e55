//! Model catalog - curated models available to the app

use serde::{Deserialize, Serialize};

/// Behavioral tag for a model's output convention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Plain chat model; everything it emits is the answer
    Standard,
    /// Emits a delimited `<think>…</think>` segment before its answer
    Reasoning,
}

/// Immutable description of a downloadable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier (used as filename without extension)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Description
    pub description: String,
    /// On-disk size estimate in bytes
    pub size_bytes: u64,
    /// HuggingFace repository ID
    pub hf_repo: String,
    /// GGUF filename in the HuggingFace repo
    pub gguf_file: String,
    /// Download URL
    pub url: String,
    /// Context length
    pub context_length: u32,
    /// Output convention
    pub kind: ModelKind,
}

/// Curated list of models the app knows how to download and run.
pub fn available_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            id: "llama-3.2-3b-instruct".to_string(),
            name: "Llama 3.2 3B Instruct".to_string(),
            description: "Meta's small instruct model, a good general-purpose default.".to_string(),
            size_bytes: 2_000_000_000, // ~2 GB
            hf_repo: "bartowski/Llama-3.2-3B-Instruct-GGUF".to_string(),
            gguf_file: "Llama-3.2-3B-Instruct-Q4_K_M.gguf".to_string(),
            url: "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf".to_string(),
            context_length: 131072,
            kind: ModelKind::Standard,
        },
        ModelDescriptor {
            id: "llama-3.2-1b-instruct".to_string(),
            name: "Llama 3.2 1B Instruct".to_string(),
            description: "Smallest Llama model, fast and lightweight.".to_string(),
            size_bytes: 800_000_000, // ~0.8 GB
            hf_repo: "bartowski/Llama-3.2-1B-Instruct-GGUF".to_string(),
            gguf_file: "Llama-3.2-1B-Instruct-Q4_K_M.gguf".to_string(),
            url: "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf".to_string(),
            context_length: 131072,
            kind: ModelKind::Standard,
        },
        ModelDescriptor {
            id: "qwen3-4b".to_string(),
            name: "Qwen3 4B".to_string(),
            description: "Alibaba's hybrid reasoning model; emits a thinking segment before answering.".to_string(),
            size_bytes: 2_500_000_000, // ~2.5 GB
            hf_repo: "Qwen/Qwen3-4B-GGUF".to_string(),
            gguf_file: "Qwen3-4B-Q4_K_M.gguf".to_string(),
            url: "https://huggingface.co/Qwen/Qwen3-4B-GGUF/resolve/main/Qwen3-4B-Q4_K_M.gguf".to_string(),
            context_length: 32768,
            kind: ModelKind::Reasoning,
        },
        ModelDescriptor {
            id: "deepseek-r1-distill-qwen-1.5b".to_string(),
            name: "DeepSeek R1 Distill Qwen 1.5B".to_string(),
            description: "Compact reasoning distill; verbose thinking traces, small footprint.".to_string(),
            size_bytes: 1_100_000_000, // ~1.1 GB
            hf_repo: "bartowski/DeepSeek-R1-Distill-Qwen-1.5B-GGUF".to_string(),
            gguf_file: "DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf".to_string(),
            url: "https://huggingface.co/bartowski/DeepSeek-R1-Distill-Qwen-1.5B-GGUF/resolve/main/DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf".to_string(),
            context_length: 131072,
            kind: ModelKind::Reasoning,
        },
        ModelDescriptor {
            id: "phi-3.5-mini".to_string(),
            name: "Phi 3.5 Mini".to_string(),
            description: "Microsoft's efficient small model.".to_string(),
            size_bytes: 2_200_000_000, // ~2.2 GB
            hf_repo: "bartowski/Phi-3.5-mini-instruct-GGUF".to_string(),
            gguf_file: "Phi-3.5-mini-instruct-Q4_K_M.gguf".to_string(),
            url: "https://huggingface.co/bartowski/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct-Q4_K_M.gguf".to_string(),
            context_length: 131072,
            kind: ModelKind::Standard,
        },
    ]
}

/// Look up a model descriptor by id.
pub fn find_model(model_id: &str) -> Option<ModelDescriptor> {
    available_models().into_iter().find(|m| m.id == model_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_model() {
        let m = find_model("llama-3.2-3b-instruct").unwrap();
        assert_eq!(m.kind, ModelKind::Standard);
        assert!(m.url.ends_with(".gguf"));

        assert!(find_model("no-such-model").is_none());
    }

    #[test]
    fn test_reasoning_models_tagged() {
        let models = available_models();
        let qwen = models.iter().find(|m| m.id == "qwen3-4b").unwrap();
        assert_eq!(qwen.kind, ModelKind::Reasoning);
    }

    #[test]
    fn test_ids_unique() {
        let models = available_models();
        for (i, a) in models.iter().enumerate() {
            for b in &models[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }
}
