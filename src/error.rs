//! Error types for the edgequake-ocr2md library.
//!
//! Three error types reflect three failure scopes:
//!
//! * [`Ocr2MdError`]: **Fatal**: the document cannot be processed at all
//!   (unreadable input, corrupt PDF, bad configuration) or the caller asked
//!   for a strict result. Returned as `Err(Ocr2MdError)` from the top-level
//!   `convert*` functions.
//!
//! * [`UnitError`]: **Non-fatal**: one work unit (a page range) failed after
//!   its retry budget, or failed fatally, but sibling units are unaffected.
//!   Stored inside [`crate::output::UnitResult`] so callers can see exactly
//!   which page ranges are missing and why.
//!
//! * [`MalformedTableError`]: **Per-region**: a table-like region could not
//!   be normalised into a rectangular record. The region is skipped; other
//!   regions and the Markdown itself are unaffected.

use crate::document::PageRange;
use crate::pipeline::engine::FailureCategory;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr2md library.
///
/// Unit-level failures use [`UnitError`] and are stored in
/// [`crate::output::UnitResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum Ocr2MdError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file is neither a PDF nor a supported image format.
    #[error("Unsupported input format: '{path}'\nExpected PDF, PNG, JPEG, TIFF or BMP. First bytes: {magic:?}")]
    UnsupportedFormat { path: PathBuf, magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// The document has no renderable pages or its page structure is unreadable.
    #[error("Invalid document '{path}': {detail}")]
    InvalidDocument { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    // ── Merge errors ──────────────────────────────────────────────────────
    /// Not every unit produced a successful result; the merge refuses to
    /// produce a partial document.
    #[error("Cannot merge: {} of {total} units missing (indices {})", .missing.len(), join_indices(.missing))]
    IncompleteMerge { missing: Vec<usize>, total: usize },

    /// Every unit failed; there is nothing to return.
    #[error("All {total} units failed.\nFirst error: {first_error}")]
    AllUnitsFailed { total: usize, first_error: String },

    /// Some units succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ConversionOutput::into_result`] when
    /// the caller wants to treat any unit failure as an error.
    #[error("{failed}/{total} units failed during conversion")]
    PartialFailure {
        success: usize,
        failed: usize,
        total: usize,
    },

    /// The run was cancelled before any unit completed.
    #[error("Conversion cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not serialise a table to CSV.
    #[error("Failed to export table to '{path}': {detail}")]
    TableExportFailed { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_indices(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A non-fatal error for a single work unit.
///
/// Stored alongside [`crate::output::UnitResult`] when a unit fails. The
/// document run continues; the missing unit later blocks the merge.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum UnitError {
    /// Transient failures on every attempt until the retry budget ran out.
    #[error("Unit {index} (pages {pages}): {category} after {attempts} attempts: {detail}")]
    TransientInvocation {
        index: usize,
        pages: PageRange,
        category: FailureCategory,
        attempts: u32,
        detail: String,
    },

    /// The engine rejected the input; retrying cannot help.
    #[error("Unit {index} (pages {pages}): {category}: {detail}")]
    FatalInvocation {
        index: usize,
        pages: PageRange,
        category: FailureCategory,
        detail: String,
    },

    /// The page range could not be rendered to images.
    #[error("Unit {index} (pages {pages}): rendering failed: {detail}")]
    RenderFailed {
        index: usize,
        pages: PageRange,
        detail: String,
    },

    /// The unit was in flight when the run was cancelled.
    #[error("Unit {index} (pages {pages}): cancelled")]
    Cancelled { index: usize, pages: PageRange },
}

impl UnitError {
    /// Sequence index of the unit that failed.
    pub fn index(&self) -> usize {
        match self {
            UnitError::TransientInvocation { index, .. }
            | UnitError::FatalInvocation { index, .. }
            | UnitError::RenderFailed { index, .. }
            | UnitError::Cancelled { index, .. } => *index,
        }
    }

    /// Page range covered by the failed unit.
    pub fn pages(&self) -> PageRange {
        match self {
            UnitError::TransientInvocation { pages, .. }
            | UnitError::FatalInvocation { pages, .. }
            | UnitError::RenderFailed { pages, .. }
            | UnitError::Cancelled { pages, .. } => *pages,
        }
    }
}

/// A detected table region that could not be normalised.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("Table region {region} (lines {start_line}-{end_line}) skipped: {reason}")]
pub struct MalformedTableError {
    /// Position of the region among all detected regions (0-based).
    pub region: usize,
    /// First line of the region (0-based, inclusive).
    pub start_line: usize,
    /// Last line of the region (0-based, inclusive).
    pub end_line: usize,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_display() {
        let e = Ocr2MdError::PartialFailure {
            success: 2,
            failed: 1,
            total: 3,
        };
        assert!(e.to_string().contains("1/3"), "got: {e}");
    }

    #[test]
    fn incomplete_merge_names_missing_indices() {
        let e = Ocr2MdError::IncompleteMerge {
            missing: vec![2, 4],
            total: 5,
        };
        let msg = e.to_string();
        assert!(msg.contains("2 of 5"), "got: {msg}");
        assert!(msg.contains("indices 2, 4"), "got: {msg}");
    }

    #[test]
    fn unit_error_accessors() {
        let e = UnitError::TransientInvocation {
            index: 3,
            pages: PageRange::new(13, 16),
            category: FailureCategory::Timeout,
            attempts: 3,
            detail: "no output within 600s".into(),
        };
        assert_eq!(e.index(), 3);
        assert_eq!(e.pages(), PageRange::new(13, 16));
        let msg = e.to_string();
        assert!(msg.contains("pages 13-16"), "got: {msg}");
        assert!(msg.contains("3 attempts"), "got: {msg}");
    }

    #[test]
    fn malformed_table_display() {
        let e = MalformedTableError {
            region: 1,
            start_line: 10,
            end_line: 14,
            reason: "header has no cells".into(),
        };
        assert!(e.to_string().contains("lines 10-14"));
    }
}
