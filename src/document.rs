//! The unit of work and its slices.
//!
//! A [`Document`] is one uploaded PDF or image. The planner slices it into
//! [`WorkUnit`]s, each covering a contiguous [`PageRange`]; the unit's
//! `index` is the only thing that decides where its Markdown lands in the
//! merged output.

use crate::error::Ocr2MdError;
use crate::pipeline::{input, render::PageRenderer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What kind of file the document came from.
///
/// Images always produce exactly one work unit and skip rendering; PDFs are
/// rendered page-range by page-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pdf,
    Image(ImageFormat),
}

/// Raster formats accepted as direct engine input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Pdf => write!(f, "pdf"),
            SourceKind::Image(ImageFormat::Png) => write!(f, "png image"),
            SourceKind::Image(ImageFormat::Jpeg) => write!(f, "jpeg image"),
            SourceKind::Image(ImageFormat::Tiff) => write!(f, "tiff image"),
            SourceKind::Image(ImageFormat::Bmp) => write!(f, "bmp image"),
        }
    }
}

/// Lifecycle of a document run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    /// Units planned, none dispatched yet.
    Planned,
    Processing,
    /// Every unit succeeded and the merge produced a document.
    Completed,
    /// Some units failed; the successful results are kept but no merged
    /// document exists.
    Degraded,
    /// No unit succeeded.
    Failed,
    /// Cancellation was requested before every unit finished.
    Cancelled,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Planned => "planned",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Degraded => "degraded",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An inclusive, 1-indexed page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of pages covered.
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// 0-indexed page indices, as pdfium expects them.
    pub fn zero_based(&self) -> std::ops::Range<usize> {
        (self.start - 1)..self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One uploaded PDF or image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub kind: SourceKind,
    pub path: PathBuf,
    /// Page count; always 1 for images.
    pub page_count: usize,
    /// Name the upload arrived with, used to name output artifacts.
    pub original_filename: String,
    pub status: DocumentStatus,
}

impl Document {
    /// Build a document descriptor directly, e.g. when the caller already
    /// knows the page count.
    pub fn new(path: impl Into<PathBuf>, kind: SourceKind, page_count: usize) -> Self {
        let path = path.into();
        let original_filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        Self {
            id: Uuid::new_v4(),
            kind,
            path,
            page_count: if matches!(kind, SourceKind::Image(_)) { 1 } else { page_count },
            original_filename,
            status: DocumentStatus::Pending,
        }
    }

    /// Sniff the source kind and, for PDFs, read the page count.
    ///
    /// Fails with [`Ocr2MdError::InvalidDocument`] if the PDF cannot be
    /// opened or has zero pages.
    pub fn open(path: &Path, renderer: &dyn PageRenderer) -> Result<Self, Ocr2MdError> {
        let kind = input::detect_source_kind(path)?;
        let page_count = match kind {
            SourceKind::Pdf => renderer.page_count(path)?,
            SourceKind::Image(_) => 1,
        };
        if page_count == 0 {
            return Err(Ocr2MdError::InvalidDocument {
                path: path.to_path_buf(),
                detail: "document has no pages".into(),
            });
        }
        Ok(Self::new(path, kind, page_count))
    }

    /// File stem used to name artifacts (`<stem>.md`, `tables_csv_<stem>/`).
    pub fn stem(&self) -> String {
        Path::new(&self.original_filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self.kind, SourceKind::Pdf)
    }
}

/// One bounded slice of a document, dispatched as a single extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub document_id: Uuid,
    /// Position in the merged output, 0..N-1.
    pub index: usize,
    pub pages: PageRange,
    pub source: UnitSource,
}

/// Where the unit's images come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitSource {
    /// Pages of a PDF still to be rendered.
    PdfPages { path: PathBuf },
    /// An image handed to the engine as-is.
    Image { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_range_len_and_display() {
        let r = PageRange::new(5, 8);
        assert_eq!(r.len(), 4);
        assert_eq!(r.to_string(), "5-8");
        assert_eq!(r.zero_based(), 4..8);
        assert_eq!(PageRange::new(3, 3).to_string(), "3");
    }

    #[test]
    fn image_document_has_one_page() {
        let doc = Document::new("/tmp/scan.png", SourceKind::Image(ImageFormat::Png), 7);
        assert_eq!(doc.page_count, 1);
        assert_eq!(doc.stem(), "scan");
        assert!(!doc.is_pdf());
    }

    #[test]
    fn document_ids_are_unique() {
        let a = Document::new("/tmp/a.pdf", SourceKind::Pdf, 3);
        let b = Document::new("/tmp/a.pdf", SourceKind::Pdf, 3);
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, DocumentStatus::Pending);
    }
}
