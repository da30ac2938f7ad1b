use std::io::Cursor as IoCursor;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use image::{ImageFormat, ImageReader};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::platform::AttachmentRef;

/// Generic name used when relaying stickers as files.
pub const STICKER_FILE_NAME: &str = "sticker.png";

/// An attachment fully written to local disk, ready for upload.
///
/// The backing file is unique to this transfer and removed on drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    file_name: String,
    len: u64,
}

impl StagedFile {
    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Name to present to the destination platform.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Exact byte count on disk.
    pub fn byte_count(&self) -> u64 {
        self.len
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read staged file: {}", self.path.display()))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staged file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Moves binary payloads from a source URL into local staging.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Download an attachment as-is.
    async fn stage(&self, attachment: &AttachmentRef) -> Result<StagedFile>;

    /// Download an image and re-encode it as PNG under a generic name.
    async fn stage_sticker(&self, attachment: &AttachmentRef) -> Result<StagedFile>;
}

/// HTTP implementation of [`Transfer`] with per-transfer staging files.
pub struct TransferAdapter {
    client: reqwest::Client,
    staging_dir: PathBuf,
}

impl TransferAdapter {
    pub fn new(staging_dir: PathBuf, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(&staging_dir).with_context(|| {
            format!(
                "Failed to create staging directory: {}",
                staging_dir.display()
            )
        })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build transfer HTTP client")?;

        Ok(Self {
            client,
            staging_dir,
        })
    }

    fn allocate(&self, file_name: &str, extension: &str) -> StagedFile {
        let path = self
            .staging_dir
            .join(format!("transfer-{}{}", Uuid::new_v4(), extension));
        let file_name = if file_name.trim().is_empty() {
            format!("file{}", extension)
        } else {
            file_name.to_string()
        };
        StagedFile {
            path,
            file_name,
            len: 0,
        }
    }

    /// Write an in-memory payload into a fresh staging file.
    pub async fn stage_bytes(&self, file_name: &str, bytes: &[u8]) -> Result<StagedFile> {
        let extension = extension_from_path(file_name);
        let mut staged = self.allocate(file_name, &extension);

        let mut file = tokio::fs::File::create(&staged.path)
            .await
            .with_context(|| format!("Failed to create {}", staged.path.display()))?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;

        staged.len = bytes.len() as u64;
        Ok(staged)
    }
}

#[async_trait]
impl Transfer for TransferAdapter {
    async fn stage(&self, attachment: &AttachmentRef) -> Result<StagedFile> {
        let mut request = self.client.get(&attachment.url);
        if let Some(auth) = &attachment.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to download {}", attachment.file_name))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "Download of {} failed with status {}",
                attachment.file_name,
                status
            );
        }

        // Allocated before writing so that an early return removes the partial file.
        let mut staged = self.allocate(&attachment.file_name, &extension_from_url(&attachment.url));
        let mut file = tokio::fs::File::create(&staged.path)
            .await
            .with_context(|| format!("Failed to create {}", staged.path.display()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .with_context(|| format!("Download of {} interrupted", attachment.file_name))?;
            file.write_all(&chunk).await?;
            staged.len += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        debug!(
            "Staged {} ({} bytes) at {}",
            staged.file_name,
            staged.len,
            staged.path.display()
        );
        Ok(staged)
    }

    async fn stage_sticker(&self, attachment: &AttachmentRef) -> Result<StagedFile> {
        let original = self.stage(attachment).await?;
        let bytes = original.read_all().await?;

        let png = tokio::task::spawn_blocking(move || reencode_image(&bytes))
            .await
            .context("Sticker re-encode task panicked")??;

        self.stage_bytes(STICKER_FILE_NAME, &png).await
    }
}

/// Decode any supported image format and encode it as PNG.
pub fn reencode_image(data: &[u8]) -> Result<Vec<u8>> {
    let img = ImageReader::new(IoCursor::new(data))
        .with_guessed_format()
        .context("failed to guess image format")?
        .decode()
        .context("failed to decode image")?;

    let mut output = IoCursor::new(Vec::new());
    img.write_to(&mut output, ImageFormat::Png)
        .context("failed to encode image as png")?;
    Ok(output.into_inner())
}

/// `.ext` from the last URL path segment, ignoring query strings.
pub fn extension_from_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(extension_from_path))
            .unwrap_or_default(),
        Err(_) => extension_from_path(url),
    }
}

fn extension_from_path(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 8
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}
