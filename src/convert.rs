//! Eager (full-document) conversion entry points.
//!
//! [`Pipeline`] wires the stages together: plan units, render and dispatch
//! them through a bounded worker pool, merge the fragments in index order and
//! extract tables from the merged text. The free functions are thin wrappers
//! that resolve input, build a pipeline from a [`ConversionConfig`] and run it.
//!
//! Use [`crate::stream::convert_stream`] instead to receive unit results as
//! they complete.

use crate::cancel::CancelToken;
use crate::config::ConversionConfig;
use crate::document::{Document, DocumentStatus, UnitSource, WorkUnit};
use crate::error::{Ocr2MdError, UnitError};
use crate::output::{
    ArtifactReport, ConversionOutput, ConversionStats, DocumentPlan, FailedRange, UnitResult,
};
use crate::pipeline::engine::{ExtractionEngine, MarkerCliEngine};
use crate::pipeline::input;
use crate::pipeline::invoker::{ExtractionInvoker, RetryPolicy};
use crate::pipeline::planner::ChunkPlanner;
use crate::pipeline::postprocess::clean_fragment;
use crate::pipeline::probe::{CachedProbe, ExecutionTier, NvidiaSmiProbe, ResourceProbe};
use crate::pipeline::render::{PageRenderer, PdfiumRenderer};
use crate::pipeline::tables::{self, TableExtraction, TableExtractor};
use futures::stream::{self, Stream, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// The assembled conversion pipeline for one configuration.
///
/// Cheap to build; holds no per-document state, so one pipeline can run
/// several documents.
pub struct Pipeline {
    config: ConversionConfig,
    planner: ChunkPlanner,
    invoker: ExtractionInvoker,
    renderer: Arc<dyn PageRenderer>,
    tables: TableExtractor,
}

impl Pipeline {
    /// Resolve every collaborator the config leaves unset to its production
    /// implementation: `marker_single`, a cached `nvidia-smi` probe and pdfium.
    pub fn new(config: &ConversionConfig) -> Self {
        let engine: Arc<dyn ExtractionEngine> = config.engine.clone().unwrap_or_else(|| {
            Arc::new(MarkerCliEngine::new(
                config.engine_command.clone(),
                config.engine_args.clone(),
            ))
        });
        let probe: Arc<dyn ResourceProbe> = config.probe.clone().unwrap_or_else(|| {
            Arc::new(CachedProbe::new(
                NvidiaSmiProbe::default(),
                Duration::from_millis(config.probe_refresh_ms),
            ))
        });
        let renderer: Arc<dyn PageRenderer> = config.renderer.clone().unwrap_or_else(|| {
            Arc::new(PdfiumRenderer::new(
                config.max_rendered_pixels,
                config.password.clone(),
            ))
        });

        let invoker = ExtractionInvoker::new(
            engine,
            probe,
            config.tier_thresholds(),
            RetryPolicy {
                max_retries: config.max_retries,
                backoff_ms: config.retry_backoff_ms,
            },
            config.attempt_timeout(),
        )
        .with_progress(config.progress_callback.clone());

        Self {
            config: config.clone(),
            planner: ChunkPlanner::new(config.page_budget, config.page_separator.clone()),
            invoker,
            renderer,
            tables: TableExtractor::new(),
        }
    }

    pub fn planner(&self) -> &ChunkPlanner {
        &self.planner
    }

    /// Open a local file as a [`Document`]. Reading the page count is
    /// blocking, so it runs off the async runtime.
    pub async fn open(&self, path: &Path) -> Result<Document, Ocr2MdError> {
        let renderer = Arc::clone(&self.renderer);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Document::open(&path, renderer.as_ref()))
            .await
            .map_err(|e| Ocr2MdError::Internal(format!("Document open task failed: {}", e)))?
    }

    /// Worker-pool size: the configured value, or one derived from the tier
    /// the probe reports right now.
    pub async fn worker_count(&self) -> usize {
        if let Some(n) = self.config.concurrency {
            return n.max(1);
        }
        let snapshot = self.invoker.snapshot().await;
        let tier = snapshot.select_tier(self.config.tier_thresholds());
        let n = snapshot.worker_capacity(tier);
        info!("Detected {} tier, using {} workers", tier, n);
        n
    }

    /// Run every unit of `document` to a terminal result and assemble the
    /// output.
    ///
    /// Successful results in `prior` (from an earlier, interrupted run of the
    /// same document and page budget) are reused instead of dispatched
    /// again. Unit failures never abort the run: they are reported in
    /// `failed_ranges`, and `merged` is `None` until every unit succeeds.
    /// A run where no unit succeeded ends with [`DocumentStatus::Failed`].
    ///
    /// # Errors
    /// - [`Ocr2MdError::InvalidDocument`] if the document cannot be planned
    pub async fn run(
        &self,
        mut document: Document,
        cancel: &CancelToken,
        prior: &[UnitResult],
    ) -> Result<ConversionOutput, Ocr2MdError> {
        let start = Instant::now();

        // ── Step 1: Plan ─────────────────────────────────────────────────
        let units = self.planner.split(&document)?;
        let total_units = units.len();
        document.status = DocumentStatus::Planned;

        let carried = carried_over(&units, prior);
        let pending: Vec<WorkUnit> = units
            .into_iter()
            .filter(|u| !carried.contains_key(&u.index))
            .collect();
        info!(
            "Document {}: {} pages, {} units ({} resumed)",
            document.original_filename,
            document.page_count,
            total_units,
            carried.len()
        );

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_conversion_start(pending.len());
        }

        // ── Step 2: Dispatch ─────────────────────────────────────────────
        document.status = DocumentStatus::Processing;
        let scratch = scratch_dir()?;
        let workers = self.worker_count().await;
        let dispatched = pending.len();

        let extraction_start = Instant::now();
        let fresh: Vec<UnitResult> = self
            .unit_stream(&document, pending, scratch.path(), cancel, workers)
            .collect()
            .await;
        let extraction_duration_ms = extraction_start.elapsed().as_millis() as u64;

        let fresh_successes = fresh.iter().filter(|r| r.succeeded()).count();
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_conversion_complete(dispatched, fresh_successes);
        }

        // ── Step 3: Collect in index order ───────────────────────────────
        let resumed_units = carried.len();
        let mut results: Vec<UnitResult> = carried.into_values().chain(fresh).collect();
        results.sort_by_key(|r| r.index);

        let failed_ranges: Vec<FailedRange> = results
            .iter()
            .filter_map(|r| {
                r.error.clone().map(|error| FailedRange {
                    index: r.index,
                    pages: r.pages,
                    error,
                })
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let skipped = failed_ranges
            .iter()
            .filter(|f| matches!(f.error, UnitError::Cancelled { .. }))
            .count();
        let cancelled = cancel.is_cancelled() && skipped > 0;

        // ── Step 4: Merge ────────────────────────────────────────────────
        let merged = match self.planner.merge(&results, total_units) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };

        // ── Step 5: Tables ───────────────────────────────────────────────
        let TableExtraction { tables, skipped: skipped_tables } = match &merged {
            Some(m) if self.config.extract_tables => self.tables.extract(&m.markdown),
            _ => TableExtraction::default(),
        };

        document.status = if cancelled {
            DocumentStatus::Cancelled
        } else if succeeded == 0 {
            DocumentStatus::Failed
        } else if merged.is_some() {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Degraded
        };

        let stats = ConversionStats {
            total_pages: document.page_count,
            total_units,
            succeeded_units: succeeded,
            failed_units: failed_ranges.len() - skipped,
            skipped_units: skipped,
            resumed_units,
            total_attempts: results.iter().map(|r| r.attempts).sum(),
            accelerated_units: count_tier(&results, ExecutionTier::Accelerated),
            fallback_units: count_tier(&results, ExecutionTier::Fallback),
            total_duration_ms: start.elapsed().as_millis() as u64,
            extraction_duration_ms,
        };

        info!(
            "Conversion {}: {}/{} units, {} tables, {}ms total",
            document.status,
            succeeded,
            total_units,
            tables.len(),
            stats.total_duration_ms
        );

        Ok(ConversionOutput {
            document,
            merged,
            units: results,
            failed_ranges,
            tables,
            skipped_tables,
            stats,
        })
    }

    /// Dispatch `units` through a pool of `workers`, yielding results in
    /// completion order.
    pub(crate) fn unit_stream<'a>(
        &'a self,
        document: &'a Document,
        units: Vec<WorkUnit>,
        scratch: &'a Path,
        cancel: &'a CancelToken,
        workers: usize,
    ) -> impl Stream<Item = UnitResult> + Send + 'a {
        let total = document_unit_total(document, &self.planner);
        stream::iter(units)
            .map(move |unit| self.process_unit(unit, scratch, cancel, total))
            .buffer_unordered(workers.max(1))
    }

    /// Render, invoke and clean one unit.
    pub(crate) async fn process_unit(
        &self,
        unit: WorkUnit,
        scratch: &Path,
        cancel: &CancelToken,
        total: usize,
    ) -> UnitResult {
        if cancel.is_cancelled() {
            debug!("Skipping unit {}: run cancelled", unit.index);
            return skipped(&unit);
        }
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_unit_start(unit.index, unit.pages, total);
        }

        let start = Instant::now();
        let mut result = match self.unit_images(&unit, scratch).await {
            Ok(images) => self.invoker.invoke(&unit, &images, scratch, cancel).await,
            Err(detail) => {
                warn!("Unit {} (pages {}): render failed: {}", unit.index, unit.pages, detail);
                UnitResult {
                    index: unit.index,
                    pages: unit.pages,
                    markdown: String::new(),
                    tier: ExecutionTier::Fallback,
                    attempts: 0,
                    duration_ms: start.elapsed().as_millis() as u64,
                    engine_log: None,
                    error: Some(UnitError::RenderFailed {
                        index: unit.index,
                        pages: unit.pages,
                        detail,
                    }),
                }
            }
        };

        if result.succeeded() {
            result.markdown = clean_fragment(&result.markdown);
        }

        if let Some(ref cb) = self.config.progress_callback {
            match &result.error {
                None => cb.on_unit_complete(unit.index, total, result.markdown.len(), result.tier),
                Some(e) => cb.on_unit_error(unit.index, total, &e.to_string()),
            }
        }
        result
    }

    /// Image files for a unit: the image itself, or its PDF pages rendered
    /// into the scratch directory.
    async fn unit_images(&self, unit: &WorkUnit, scratch: &Path) -> Result<Vec<PathBuf>, String> {
        match &unit.source {
            UnitSource::Image { path } => Ok(vec![path.clone()]),
            UnitSource::PdfPages { path } => {
                let renderer = Arc::clone(&self.renderer);
                let path = path.clone();
                let pages = unit.pages;
                let out_dir = scratch.join(format!("unit_{:04}_pages", unit.index));
                let render_start = Instant::now();
                let images = tokio::task::spawn_blocking(move || {
                    renderer.render(&path, pages, &out_dir)
                })
                .await
                .map_err(|e| format!("render task failed: {}", e))??;
                debug!(
                    "Rendered pages {} in {}ms",
                    unit.pages,
                    render_start.elapsed().as_millis()
                );
                Ok(images)
            }
        }
    }

    /// Extract tables from Markdown with this pipeline's settings.
    pub fn extract_tables(&self, markdown: &str) -> TableExtraction {
        self.tables.extract(markdown)
    }
}

/// Prior successes that still line up with the current plan.
fn carried_over(units: &[WorkUnit], prior: &[UnitResult]) -> BTreeMap<usize, UnitResult> {
    let mut carried = BTreeMap::new();
    for r in prior.iter().filter(|r| r.succeeded()) {
        match units.get(r.index) {
            Some(u) if u.pages == r.pages => {
                carried.entry(r.index).or_insert_with(|| r.clone());
            }
            _ => debug!(
                "Ignoring prior result for unit {} (pages {}): plan changed",
                r.index, r.pages
            ),
        }
    }
    carried
}

pub(crate) fn document_unit_total(document: &Document, planner: &ChunkPlanner) -> usize {
    if document.is_pdf() {
        document.page_count.div_ceil(planner.page_budget())
    } else {
        1
    }
}

fn skipped(unit: &WorkUnit) -> UnitResult {
    UnitResult {
        index: unit.index,
        pages: unit.pages,
        markdown: String::new(),
        tier: ExecutionTier::Fallback,
        attempts: 0,
        duration_ms: 0,
        engine_log: None,
        error: Some(UnitError::Cancelled {
            index: unit.index,
            pages: unit.pages,
        }),
    }
}

fn count_tier(results: &[UnitResult], tier: ExecutionTier) -> usize {
    results
        .iter()
        .filter(|r| r.succeeded() && r.tier == tier)
        .count()
}

pub(crate) fn scratch_dir() -> Result<TempDir, Ocr2MdError> {
    tempfile::Builder::new()
        .prefix("ocr2md-")
        .tempdir()
        .map_err(|e| Ocr2MdError::Internal(format!("Failed to create scratch directory: {}", e)))
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Convert a PDF or image (path or URL) to Markdown.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(ConversionOutput)` even if some units failed; check
/// `output.merged` / `output.failed_ranges`, or call
/// [`ConversionOutput::into_result`] to treat any failure as an error.
///
/// # Errors
/// Returns `Err(Ocr2MdError)` only for fatal errors:
/// - File not found, unsupported format, download failure
/// - Unreadable or empty PDF
/// - Every unit failed
pub async fn convert(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Ocr2MdError> {
    convert_cancellable(input_str, config, &CancelToken::new(), &[]).await
}

/// [`convert`] with a cancellation token and results from an earlier run.
pub async fn convert_cancellable(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
    cancel: &CancelToken,
    prior: &[UnitResult],
) -> Result<ConversionOutput, Ocr2MdError> {
    let input_str = input_str.as_ref();
    info!("Starting conversion: {}", input_str);

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let pipeline = Pipeline::new(config);
    let document = pipeline.open(resolved.path()).await?;
    // `resolved` keeps a downloaded file alive until the run finishes.
    pipeline.run(document, cancel, prior).await
}

/// Convert and write the artifacts into `out_dir`.
///
/// See [`write_artifacts`] for the layout.
pub async fn convert_to_dir(
    input_str: impl AsRef<str>,
    out_dir: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<ArtifactReport, Ocr2MdError> {
    let output = convert(input_str, config).await?;
    write_artifacts(&output, out_dir.as_ref()).await
}

/// Write a run's artifacts:
///
/// - `<out>/<stem>.md`: merged Markdown, only when every unit succeeded
/// - `<out>/tables_csv_<stem>/table_<n>.csv`: one file per table
/// - `<out>/<stem>.units.json`: unit results, only when the run is
///   incomplete, so a later run can resume
///
/// Files are written atomically (temp file + rename).
pub async fn write_artifacts(
    output: &ConversionOutput,
    out_dir: &Path,
) -> Result<ArtifactReport, Ocr2MdError> {
    let stem = output.document.stem();
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| Ocr2MdError::OutputWriteFailed {
            path: out_dir.to_path_buf(),
            source: e,
        })?;

    let units_path = out_dir.join(format!("{}.units.json", stem));
    let markdown_path = match &output.merged {
        Some(merged) => {
            let path = out_dir.join(format!("{}.md", stem));
            write_atomic(&path, merged.markdown.as_bytes()).await?;
            info!("Wrote {}", path.display());
            Some(path)
        }
        None => None,
    };

    let units_path = if markdown_path.is_some() {
        if tokio::fs::try_exists(&units_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&units_path)
                .await
                .map_err(|e| Ocr2MdError::OutputWriteFailed {
                    path: units_path.clone(),
                    source: e,
                })?;
        }
        None
    } else {
        let json = serde_json::to_vec_pretty(&output.units)
            .map_err(|e| Ocr2MdError::Internal(format!("Failed to serialise unit results: {}", e)))?;
        write_atomic(&units_path, &json).await?;
        info!("Saved unit results for resume to {}", units_path.display());
        Some(units_path)
    };

    let table_paths = if output.tables.is_empty() {
        Vec::new()
    } else {
        let dir = out_dir.join(format!("tables_csv_{}", stem));
        let tables = output.tables.clone();
        tokio::task::spawn_blocking(move || tables::write_tables_csv(&tables, &dir))
            .await
            .map_err(|e| Ocr2MdError::Internal(format!("Table export task failed: {}", e)))??
    };

    Ok(ArtifactReport {
        document_id: output.document.id.to_string(),
        status: output.document.status,
        markdown_path,
        table_paths,
        units_path,
        failed_ranges: output.failed_ranges.clone(),
        processing_time_secs: output.stats.total_duration_ms as f64 / 1000.0,
    })
}

/// Load unit results saved by [`write_artifacts`] for a resumed run.
pub async fn load_unit_results(path: &Path) -> Result<Vec<UnitResult>, Ocr2MdError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| Ocr2MdError::FileNotFound {
            path: path.to_path_buf(),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| Ocr2MdError::InvalidDocument {
        path: path.to_path_buf(),
        detail: format!("not a unit result file: {}", e),
    })
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Ocr2MdError> {
    let write_err = |e: std::io::Error| Ocr2MdError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<ConversionOutput, Ocr2MdError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Ocr2MdError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert(input_str, config))
}

/// Report the source kind, page count and unit plan without running the
/// engine.
pub async fn inspect(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<DocumentPlan, Ocr2MdError> {
    let resolved = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    let pipeline = Pipeline::new(config);
    let document = pipeline.open(resolved.path()).await?;
    let units = pipeline
        .planner()
        .split(&document)?
        .into_iter()
        .map(|u| u.pages)
        .collect();
    Ok(DocumentPlan { document, units })
}

/// Extract tables from an existing Markdown file.
pub async fn extract_tables_from_file(
    path: impl AsRef<Path>,
) -> Result<TableExtraction, Ocr2MdError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || tables::extract_tables_from_path(&path))
        .await
        .map_err(|e| Ocr2MdError::Internal(format!("Table extraction task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{PageRange, SourceKind};

    fn ok(index: usize, pages: PageRange) -> UnitResult {
        UnitResult {
            index,
            pages,
            markdown: "x".into(),
            tier: ExecutionTier::Fallback,
            attempts: 1,
            duration_ms: 1,
            engine_log: None,
            error: None,
        }
    }

    #[test]
    fn carried_over_requires_matching_plan() {
        let doc = Document::new("/tmp/x.pdf", SourceKind::Pdf, 10);
        let units = ChunkPlanner::new(4, Default::default()).split(&doc).unwrap();
        let prior = vec![
            ok(0, PageRange::new(1, 4)),
            ok(1, PageRange::new(5, 6)),
            ok(7, PageRange::new(29, 32)),
            UnitResult {
                error: Some(UnitError::Cancelled {
                    index: 2,
                    pages: PageRange::new(9, 10),
                }),
                ..ok(2, PageRange::new(9, 10))
            },
        ];
        let carried = carried_over(&units, &prior);
        assert_eq!(carried.keys().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn unit_total_matches_plan() {
        let planner = ChunkPlanner::new(4, Default::default());
        let doc = Document::new("/tmp/x.pdf", SourceKind::Pdf, 10);
        assert_eq!(document_unit_total(&doc, &planner), 3);
        let img = Document::new(
            "/tmp/x.png",
            SourceKind::Image(crate::document::ImageFormat::Png),
            1,
        );
        assert_eq!(document_unit_total(&img, &planner), 1);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        write_atomic(&path, b"# hi\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# hi\n");
        assert!(!dir.path().join("doc.md.tmp").exists());
    }
}
