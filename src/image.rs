use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::MkvmError;
use crate::host::HostCommand;

const STEP: &str = "base image download";

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), MkvmError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| MkvmError::provisioning(STEP, format!("creating {}: {e}", path.display())))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| MkvmError::provisioning(STEP, format!("error reading response body: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| MkvmError::provisioning(STEP, format!("writing image data: {e}")))?;
        pb.inc(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| MkvmError::provisioning(STEP, format!("flushing image file: {e}")))?;

    Ok(())
}

/// Per-process temporary path next to `dest`, so concurrent first downloads
/// never write the same file.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|f| f.to_os_string())
        .unwrap_or_else(|| "image".into());
    name.push(format!(".{}.part", std::process::id()));
    dest.with_file_name(name)
}

/// Download `url` to `dest` through a temporary file that is renamed into place.
///
/// On failure the temporary file is removed and `dest` is never created.
pub async fn download(url: &str, dest: &Path) -> Result<(), MkvmError> {
    tracing::info!(url, "downloading base image");

    let response = reqwest::get(url)
        .await
        .map_err(|e| MkvmError::provisioning(STEP, format!("request to {url} failed: {e}")))?;

    if !response.status().is_success() {
        return Err(MkvmError::provisioning(
            STEP,
            format!("HTTP {} from {url}", response.status()),
        ));
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let tmp_path = part_path(dest);

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        pb.abandon();
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, dest).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(MkvmError::provisioning(
            STEP,
            format!("renaming {} to {}: {e}", tmp_path.display(), dest.display()),
        ));
    }

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "base image downloaded");
    Ok(())
}

/// `qemu-img resize <image> <size>`
pub fn resize_command(image: &Path, size: &str) -> HostCommand {
    HostCommand::new("qemu-img")
        .arg("resize")
        .arg(image)
        .arg(size)
}
