use image::ImageFormat;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Extensions accepted for scans. PDFs are not rasterized, so only bitmaps.
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// A scan written to local storage.
#[derive(Debug, Clone)]
pub struct StoredScan {
    pub path: PathBuf,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
}

/// Content-addressed local scan storage.
pub struct ScanStorage {
    dir: PathBuf,
    max_bytes: usize,
}

impl ScanStorage {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    /// Check size, extension and that the bytes are a supported image.
    /// Returns the normalized extension.
    pub fn validate(&self, filename: &str, data: &[u8]) -> Result<String, UploadError> {
        if data.is_empty() {
            return Err(UploadError::Empty);
        }
        if data.len() > self.max_bytes {
            return Err(UploadError::TooLarge {
                size: data.len(),
                max: self.max_bytes,
            });
        }

        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| UploadError::UnsupportedType(filename.to_string()))?;
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(UploadError::UnsupportedType(extension));
        }

        match image::guess_format(data) {
            Ok(ImageFormat::Png | ImageFormat::Jpeg) => Ok(extension),
            Ok(other) => Err(UploadError::UnsupportedType(format!("{other:?}"))),
            Err(_) => Err(UploadError::NotAnImage),
        }
    }

    /// Validate and write the scan as `<sha256>.<ext>`. Identical uploads
    /// share one file.
    pub async fn save(&self, filename: &str, data: &[u8]) -> Result<StoredScan, UploadError> {
        let extension = self.validate(filename, data)?;
        let hash = format!("{:x}", Sha256::digest(data));
        let path = self.dir.join(format!("{hash}.{extension}"));

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, data).await?;

        tracing::debug!(path = %path.display(), hash = %hash, "Stored scan");
        Ok(StoredScan { path, hash })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Uploaded file is empty")]
    Empty,

    #[error("Uploaded file is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported file type: {0} (allowed: jpg, jpeg, png)")]
    UnsupportedType(String),

    #[error("Uploaded file is not a readable image")]
    NotAnImage,

    #[error("Failed to store scan: {0}")]
    Io(#[from] std::io::Error),
}
