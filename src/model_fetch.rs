use std::{
    env, fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

const MODEL_FILENAME: &str = "movenet_singlepose_thunder.onnx";
const MODEL_URL: &str =
    "https://raw.githubusercontent.com/pose-camera/models/main/movenet_singlepose_thunder.onnx";

pub fn default_model_path() -> PathBuf {
    PathBuf::from("models").join(MODEL_FILENAME)
}

fn model_url() -> String {
    env::var("POSE_CAMERA_MODEL_URL").unwrap_or_else(|_| MODEL_URL.to_string())
}

/// Make sure the pose model file exists, downloading it on first run.
/// Downloads go to a temp name and are renamed into place so a partial
/// fetch never looks like a valid model.
pub fn ensure_model_available(model_path: &Path) -> anyhow::Result<()> {
    if model_path.exists() {
        return Ok(());
    }

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let url = model_url();
    log::info!("downloading pose model from {url} to {}", model_path.display());

    let client = Client::new();
    let mut response = client
        .get(&url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total_size = response.content_length();
    let progress = create_progress_bar(total_size);

    let tmp_path = model_path.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        progress.set_position(downloaded);
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, model_path).with_context(|| {
        format!(
            "failed to move temp model {} into place at {}",
            tmp_path.display(),
            model_path.display()
        )
    })?;

    progress.finish_with_message("pose model ready");
    Ok(())
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap()
            .progress_chars("=>-");
            pb.set_style(style);
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} downloading model").unwrap();
            pb.set_style(style);
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb
        }
    }
}
