//! Model download logic - streamed GGUF fetch with fractional progress

use std::path::{Path, PathBuf};

use crate::llm_engine::catalog::ModelDescriptor;
use crate::llm_engine::error::EngineError;

/// Path a model's weights occupy once downloaded.
pub fn model_path(models_dir: &Path, model_id: &str) -> PathBuf {
    models_dir.join(format!("{}.gguf", model_id))
}

/// Whether a model's weights are already on disk.
pub fn is_downloaded(models_dir: &Path, model_id: &str) -> bool {
    model_path(models_dir, model_id).exists()
}

/// Delete a downloaded model's weights.
pub fn remove_model(models_dir: &Path, model_id: &str) -> Result<(), EngineError> {
    let path = model_path(models_dir, model_id);
    if path.exists() {
        std::fs::remove_file(&path)
            .map_err(|e| EngineError::LoadFailed(format!("Failed to delete model: {}", e)))?;
    }
    Ok(())
}

/// Download a model's weights, reporting a 0.0–1.0 fraction as chunks land.
/// Writes to a temp file and renames on success so a failed download never
/// leaves a partial file at the final path. Returns the weights path.
pub async fn download_model<F>(
    models_dir: &Path,
    model: &ModelDescriptor,
    on_progress: F,
) -> Result<PathBuf, EngineError>
where
    F: Fn(f32) + Send + Sync,
{
    let dest_path = model_path(models_dir, &model.id);

    tokio::fs::create_dir_all(models_dir)
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Failed to create models dir: {}", e)))?;

    on_progress(0.0);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3600)) // 1 hour timeout for large models
        .build()
        .map_err(|e| EngineError::LoadFailed(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(&model.url)
        .send()
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Failed to start download: {}", e)))?;

    if !response.status().is_success() {
        return Err(EngineError::LoadFailed(format!(
            "Download failed with status: {}",
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(model.size_bytes);

    let temp_path = dest_path.with_extension("gguf.tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Failed to create temp file: {}", e)))?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    use futures_util::StreamExt;
    use tokio::io::AsyncWriteExt;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result
            .map_err(|e| EngineError::LoadFailed(format!("Download error: {}", e)))?;

        file.write_all(&chunk)
            .await
            .map_err(|e| EngineError::LoadFailed(format!("Failed to write chunk: {}", e)))?;

        downloaded += chunk.len() as u64;
        if total_size > 0 {
            on_progress((downloaded as f32 / total_size as f32).min(1.0));
        }
    }

    file.flush()
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Failed to flush file: {}", e)))?;
    drop(file);

    // Basic sanity check - file should be reasonably close to expected size
    let metadata = tokio::fs::metadata(&temp_path)
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Failed to read file metadata: {}", e)))?;
    if total_size > 0 && metadata.len() < total_size / 2 {
        tokio::fs::remove_file(&temp_path).await.ok();
        return Err(EngineError::LoadFailed(format!(
            "Downloaded file too small: {} bytes (expected ~{})",
            metadata.len(),
            total_size
        )));
    }

    tokio::fs::rename(&temp_path, &dest_path)
        .await
        .map_err(|e| EngineError::LoadFailed(format!("Failed to rename temp file: {}", e)))?;

    on_progress(1.0);
    log::info!("Downloaded model '{}' to {:?}", model.id, dest_path);
    Ok(dest_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_path_layout() {
        let dir = Path::new("/tmp/models");
        assert_eq!(
            model_path(dir, "phi-3.5-mini"),
            PathBuf::from("/tmp/models/phi-3.5-mini.gguf")
        );
    }

    #[test]
    fn test_is_downloaded_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_downloaded(dir.path(), "m"));

        std::fs::write(model_path(dir.path(), "m"), b"weights").unwrap();
        assert!(is_downloaded(dir.path(), "m"));

        remove_model(dir.path(), "m").unwrap();
        assert!(!is_downloaded(dir.path(), "m"));

        // Removing a model that isn't on disk is a no-op
        remove_model(dir.path(), "m").unwrap();
    }
}
