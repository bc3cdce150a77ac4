//! # edgequake-ocr2md
//!
//! Convert scanned PDFs and images to Markdown by driving an external OCR
//! engine (`marker_single` by default), and pull the Markdown tables out as
//! CSV.
//!
//! ## Why this crate?
//!
//! OCR engines are slow, memory hungry and flaky on long documents: a
//! 300-page scan can exhaust GPU memory halfway through and lose everything.
//! This crate slices a document into small page-range units, runs them
//! through a bounded worker pool, retries failures with backoff, drops a unit
//! from the GPU to the CPU when the accelerator keeps failing or runs hot,
//! and merges the fragments back in page order. A failed unit costs its own
//! pages, never the whole run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image
//!  │
//!  ├─ 1. Input    resolve local file or download URL; sniff magic bytes
//!  ├─ 2. Plan     slice into units of ≤ page_budget pages
//!  ├─ 3. Render   rasterise a unit's pages via pdfium (spawn_blocking)
//!  ├─ 4. Probe    GPU free memory + temperature → accelerated / fallback
//!  ├─ 5. Invoke   engine call with timeout, retry and tier escalation
//!  ├─ 6. Polish   fragment cleanup (fences, invisible chars, image links)
//!  ├─ 7. Merge    fragments in unit order → one document
//!  └─ 8. Tables   Markdown tables → typed records → CSV
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr2md::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::builder().page_budget(4).build()?;
//!     let output = convert("scan.pdf", &config).await?;
//!     match output.markdown() {
//!         Some(md) => println!("{}", md),
//!         None => eprintln!("{} page ranges failed", output.failed_ranges.len()),
//!     }
//!     eprintln!("{} tables found", output.tables.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr2md` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ocr2md = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::CancelToken;
pub use config::{ConversionConfig, ConversionConfigBuilder, PageSeparator};
pub use convert::{
    convert, convert_cancellable, convert_sync, convert_to_dir, extract_tables_from_file, inspect,
    load_unit_results, write_artifacts, Pipeline,
};
pub use document::{Document, DocumentStatus, ImageFormat, PageRange, SourceKind, WorkUnit};
pub use error::{MalformedTableError, Ocr2MdError, UnitError};
pub use output::{
    ArtifactReport, ConversionOutput, ConversionStats, DocumentPlan, EngineLog, FailedRange,
    MergedDocument, UnitResult,
};
pub use pipeline::engine::{
    EngineFailure, EngineOutput, EngineRequest, ExtractionEngine, FailureCategory,
};
pub use pipeline::probe::{ExecutionTier, ResourceProbe, ResourceSnapshot, StaticProbe};
pub use pipeline::render::PageRenderer;
pub use pipeline::tables::{TableExtraction, TableExtractor, TabularRecord, EMPTY_CELL};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{convert_stream, convert_stream_cancellable, UnitStream};
