use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use reqwest::Client;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::info;

/// Makes sure the weights file exists at `path`, downloading it from `url`
/// when it does not.
///
/// The body is streamed into `<path>.part` and only renamed into place once
/// complete, so an interrupted download is retried on the next call.
pub async fn ensure_weights(client: &Client, path: &Path, url: Option<&str>) -> Result<()> {
    if fs::try_exists(path).await? {
        info!("Model already exists at {}", path.display());
        return Ok(());
    }

    let url = url.ok_or_else(|| {
        anyhow!(
            "{} is missing and no download URL is configured",
            path.display()
        )
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    info!("Downloading model weights from {url}");
    let res = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("Failed to download {url}"))?;

    let partial = partial_path(path);
    let mut file = File::create(&partial)
        .await
        .with_context(|| format!("Failed to create {}", partial.display()))?;

    let mut progress = Progress::new(res.content_length());
    let mut stream = res.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(percent) = progress.advance(chunk.len() as u64) {
            info!("Download progress: {percent}%");
        }
    }
    file.flush().await?;
    drop(file);

    fs::rename(&partial, path).await?;
    info!(
        "Model downloaded successfully ({} bytes) to {}",
        progress.downloaded,
        path.display()
    );

    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Reports download progress in 10% steps.
#[derive(Debug)]
struct Progress {
    total: Option<u64>,
    downloaded: u64,
    reported: u64,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            downloaded: 0,
            reported: 0,
        }
    }

    /// Returns the new percentage whenever another 10% step is crossed.
    fn advance(&mut self, bytes: u64) -> Option<u64> {
        self.downloaded += bytes;
        let total = self.total?;
        let percent = (self.downloaded * 100 / total).min(100);
        let step = percent / 10 * 10;
        if step > self.reported {
            self.reported = step;
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_reports_each_ten_percent_once() {
        let mut progress = Progress::new(Some(1000));
        assert_eq!(progress.advance(50), None);
        assert_eq!(progress.advance(60), Some(11));
        assert_eq!(progress.advance(50), None);
        assert_eq!(progress.advance(340), Some(50));
        assert_eq!(progress.advance(600), Some(100));
        assert_eq!(progress.advance(10), None);
    }

    #[test]
    fn progress_without_length_is_silent() {
        let mut progress = Progress::new(None);
        assert_eq!(progress.advance(1 << 20), None);
        assert_eq!(progress.downloaded, 1 << 20);
    }

    #[test]
    fn partial_file_sits_next_to_target() {
        assert_eq!(
            partial_path(Path::new("models/sam.safetensors")),
            PathBuf::from("models/sam.safetensors.part")
        );
    }
}
