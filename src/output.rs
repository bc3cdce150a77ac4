//! Result types: per-unit outcomes, the merged document and run summaries.

use crate::document::{Document, DocumentStatus, PageRange};
use crate::error::{MalformedTableError, Ocr2MdError, UnitError};
use crate::pipeline::probe::ExecutionTier;
use crate::pipeline::tables::TabularRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Terminal outcome of one work unit.
///
/// Every dispatched unit yields exactly one of these, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    /// Sequence index inherited from the work unit.
    pub index: usize,
    pub pages: PageRange,
    /// Markdown fragment; empty on failure.
    pub markdown: String,
    /// Tier of the last attempt.
    pub tier: ExecutionTier,
    /// Number of engine dispatches made.
    pub attempts: u32,
    pub duration_ms: u64,
    /// Engine stdout/stderr of the final attempt, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_log: Option<EngineLog>,
    pub error: Option<UnitError>,
}

impl UnitResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Captured process output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineLog {
    pub stdout: String,
    pub stderr: String,
}

/// Fragments of every unit concatenated in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedDocument {
    pub markdown: String,
    pub unit_count: usize,
}

/// A page range with no Markdown, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRange {
    pub index: usize,
    pub pages: PageRange,
    pub error: UnitError,
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    pub total_units: usize,
    pub succeeded_units: usize,
    pub failed_units: usize,
    /// Units cancelled before they reached a result.
    pub skipped_units: usize,
    /// Units carried over from a previous run.
    pub resumed_units: usize,
    /// Engine dispatches across all units, retries included.
    pub total_attempts: u32,
    /// Successful units whose final attempt ran on the accelerated tier.
    pub accelerated_units: usize,
    pub fallback_units: usize,
    pub total_duration_ms: u64,
    pub extraction_duration_ms: u64,
}

/// Everything a run produced.
///
/// `merged` is `None` whenever any unit is missing; the successful unit
/// results are still returned so a later run can resume from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub document: Document,
    pub merged: Option<MergedDocument>,
    /// All unit results known for the document, sorted by index.
    pub units: Vec<UnitResult>,
    pub failed_ranges: Vec<FailedRange>,
    pub tables: Vec<TabularRecord>,
    pub skipped_tables: Vec<MalformedTableError>,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    /// Merged Markdown, if the run was complete.
    pub fn markdown(&self) -> Option<&str> {
        self.merged.as_ref().map(|m| m.markdown.as_str())
    }

    pub fn is_complete(&self) -> bool {
        self.document.status == DocumentStatus::Completed
    }

    /// Treat any unit failure as an error.
    pub fn into_result(self) -> Result<Self, Ocr2MdError> {
        if self.failed_ranges.is_empty() && self.merged.is_some() {
            return Ok(self);
        }
        match self.document.status {
            DocumentStatus::Cancelled => return Err(Ocr2MdError::Cancelled),
            DocumentStatus::Failed => {
                let first_error = self
                    .failed_ranges
                    .first()
                    .map(|f| f.error.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string());
                return Err(Ocr2MdError::AllUnitsFailed {
                    total: self.stats.total_units,
                    first_error,
                });
            }
            _ => {}
        }
        Err(Ocr2MdError::PartialFailure {
            success: self.stats.succeeded_units,
            failed: self.stats.failed_units,
            total: self.stats.total_units,
        })
    }
}

/// What a run would do, without running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPlan {
    pub document: Document,
    pub units: Vec<PageRange>,
}

/// Where the run's artifacts were written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub document_id: String,
    pub status: DocumentStatus,
    /// `None` when the merge was blocked by failed units.
    pub markdown_path: Option<PathBuf>,
    pub table_paths: Vec<PathBuf>,
    /// Unit results saved for a later resumed run; `None` when complete.
    pub units_path: Option<PathBuf>,
    pub failed_ranges: Vec<FailedRange>,
    pub processing_time_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SourceKind;

    fn output(status: DocumentStatus, merged: bool, failed: usize) -> ConversionOutput {
        let mut document = Document::new("/tmp/x.pdf", SourceKind::Pdf, 8);
        document.status = status;
        let failed_ranges = (0..failed)
            .map(|i| FailedRange {
                index: i,
                pages: PageRange::new(i * 4 + 1, i * 4 + 4),
                error: UnitError::Cancelled {
                    index: i,
                    pages: PageRange::new(i * 4 + 1, i * 4 + 4),
                },
            })
            .collect();
        ConversionOutput {
            document,
            merged: merged.then(|| MergedDocument {
                markdown: "# x\n".into(),
                unit_count: 2,
            }),
            units: vec![],
            failed_ranges,
            tables: vec![],
            skipped_tables: vec![],
            stats: ConversionStats {
                total_units: 2,
                succeeded_units: 2 - failed,
                failed_units: failed,
                ..Default::default()
            },
        }
    }

    #[test]
    fn complete_output_is_ok() {
        let out = output(DocumentStatus::Completed, true, 0);
        assert_eq!(out.markdown(), Some("# x\n"));
        assert!(out.into_result().is_ok());
    }

    #[test]
    fn degraded_output_is_partial_failure() {
        let out = output(DocumentStatus::Degraded, false, 1);
        assert!(out.markdown().is_none());
        match out.into_result() {
            Err(Ocr2MdError::PartialFailure { failed, total, .. }) => {
                assert_eq!((failed, total), (1, 2));
            }
            other => panic!("expected PartialFailure, got {other:?}"),
        }
    }

    #[test]
    fn failed_output_is_all_units_failed() {
        let out = output(DocumentStatus::Failed, false, 2);
        assert_eq!(out.failed_ranges.len(), 2);
        match out.into_result() {
            Err(Ocr2MdError::AllUnitsFailed { total, first_error }) => {
                assert_eq!(total, 2);
                assert!(first_error.contains("1-4"), "{first_error}");
            }
            other => panic!("expected AllUnitsFailed, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_output_is_cancelled() {
        let out = output(DocumentStatus::Cancelled, false, 0);
        assert!(matches!(out.into_result(), Err(Ocr2MdError::Cancelled)));
    }
}
