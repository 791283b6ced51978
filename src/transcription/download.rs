use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

const MODEL_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Mirror URL for a ggml weight file
fn model_url(file_name: &str) -> String {
    format!("{MODEL_BASE_URL}/{file_name}")
}

/// Ensures the weight file exists at `model_path`, fetching `file_name` from the mirror if not
///
/// Returns true if the file was downloaded, false if it already existed.
///
/// # Errors
/// Returns error if the download fails or the file cannot be written
pub fn ensure_model_downloaded(file_name: &str, model_path: &Path) -> Result<bool> {
    if model_path.exists() {
        tracing::debug!(
            path = %model_path.display(),
            "model already exists, skipping download"
        );
        return Ok(false);
    }

    tracing::info!(
        file = file_name,
        path = %model_path.display(),
        "model not found, starting download (first run only)"
    );

    download_model(file_name, model_path)?;

    Ok(true)
}

fn download_model(file_name: &str, model_path: &Path) -> Result<()> {
    let url = model_url(file_name);

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent).context("failed to create model directory")?;
    }

    tracing::info!(url = %url, "downloading model");

    let response = reqwest::blocking::get(&url)
        .with_context(|| format!("failed to download model from {url}"))?;

    if !response.status().is_success() {
        anyhow::bail!("download failed with status {}: {}", response.status(), url);
    }

    let bytes = response.bytes().context("failed to read response bytes")?;

    // Write next to the target and rename so a partial download is never loaded
    let temp_path = model_path.with_extension("part");
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("failed to create temp file at {}", temp_path.display()))?;
        file.write_all(&bytes)
            .context("failed to write model to temp file")?;
    }

    fs::rename(&temp_path, model_path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            temp_path.display(),
            model_path.display()
        )
    })?;

    tracing::info!(
        path = %model_path.display(),
        size = bytes.len(),
        "model downloaded successfully"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_url() {
        assert_eq!(
            model_url("ggml-tiny.bin"),
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin"
        );
        assert!(model_url("ggml-base-q5_1.bin").ends_with("/ggml-base-q5_1.bin"));
    }

    #[test]
    fn test_existing_file_is_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("ggml-tiny.bin");
        fs::write(&model_path, b"dummy model data").unwrap();

        let downloaded = ensure_model_downloaded("ggml-tiny.bin", &model_path).unwrap();

        assert!(!downloaded);
        assert_eq!(fs::read(&model_path).unwrap(), b"dummy model data");
    }

    #[test]
    #[ignore] // Requires network access and downloads a 75MB file
    fn test_download_model_integration() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("models").join("ggml-tiny.bin");

        let downloaded = ensure_model_downloaded("ggml-tiny.bin", &model_path).unwrap();

        assert!(downloaded);
        assert!(fs::metadata(&model_path).unwrap().len() > 0);
        assert!(!model_path.with_extension("part").exists());
    }

    #[test]
    #[ignore] // Requires network access
    fn test_download_invalid_model() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("ggml-nonexistent-model-xyz.bin");

        let result = download_model("ggml-nonexistent-model-xyz.bin", &model_path);

        assert!(result.is_err());
        assert!(!model_path.exists());
    }
}
