//! Input resolution: normalise a user-supplied path or URL to a local file and
//! decide whether it is a PDF or an image.
//!
//! URL inputs are downloaded into a `TempDir` that lives as long as the
//! returned [`ResolvedInput`]. The source kind is decided from magic bytes,
//! not the extension.

use crate::document::{ImageFormat, SourceKind};
use crate::error::Ocr2MdError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved input: either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the file lives in a temp directory kept alive here.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    /// Get the path to the input file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a readable local file of a supported kind.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Ocr2MdError> {
    if input.trim().is_empty() {
        return Err(Ocr2MdError::InvalidInput {
            input: input.to_string(),
        });
    }
    let resolved = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        resolve_local(input)?
    };
    detect_source_kind(resolved.path())?;
    Ok(resolved)
}

/// Classify a file by its first bytes.
pub fn detect_source_kind(path: &Path) -> Result<SourceKind, Ocr2MdError> {
    let mut f = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => Ocr2MdError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => Ocr2MdError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;
    let mut magic = [0u8; 4];
    let n = f.read(&mut magic).unwrap_or(0);
    sniff(&magic[..n]).ok_or_else(|| Ocr2MdError::UnsupportedFormat {
        path: path.to_path_buf(),
        magic,
    })
}

fn sniff(bytes: &[u8]) -> Option<SourceKind> {
    match bytes {
        [b'%', b'P', b'D', b'F', ..] => Some(SourceKind::Pdf),
        [0x89, b'P', b'N', b'G', ..] => Some(SourceKind::Image(ImageFormat::Png)),
        [0xFF, 0xD8, 0xFF, ..] => Some(SourceKind::Image(ImageFormat::Jpeg)),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => {
            Some(SourceKind::Image(ImageFormat::Tiff))
        }
        [b'B', b'M', ..] => Some(SourceKind::Image(ImageFormat::Bmp)),
        _ => None,
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, Ocr2MdError> {
    let path = PathBuf::from(path_str);
    if !path.is_file() {
        return Err(Ocr2MdError::FileNotFound { path });
    }
    debug!("Resolved local input: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Ocr2MdError> {
    info!("Downloading input from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Ocr2MdError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Ocr2MdError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            Ocr2MdError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(Ocr2MdError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = filename_from_url(url);
    let temp_dir = TempDir::new().map_err(|e| Ocr2MdError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Ocr2MdError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| Ocr2MdError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded".to_string()
}
