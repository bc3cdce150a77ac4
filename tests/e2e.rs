//! End-to-end integration tests for edgequake-ocr2md.
//!
//! These tests run the real `marker_single` engine (or whatever `MARKER_CLI`
//! names) over files in `./test_cases/`, and need libpdfium for PDF inputs.
//! They are gated behind the `E2E_ENABLED` environment variable so they do
//! not run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 LD_LIBRARY_PATH=. cargo test --test e2e -- --nocapture
//!
//! To restrict to a specific test:
//!   E2E_ENABLED=1 cargo test --test e2e e2e_inspect -- --nocapture

use edgequake_ocr2md::{
    convert, convert_to_dir, inspect, ConversionConfig, DocumentStatus, PageSeparator,
    SourceKind,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no input file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP — set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP — test file not found: {}", p.display());
            return;
        }
        p
    }};
}

fn e2e_config() -> ConversionConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();

    let mut builder = ConversionConfig::builder()
        .page_budget(2)
        .max_retries(1)
        .attempt_timeout_secs(900);
    if let Ok(cmd) = std::env::var("MARKER_CLI") {
        builder = builder.engine_command(cmd);
    }
    builder.build().unwrap()
}

/// Assert the markdown passes basic quality checks.
fn assert_markdown_quality(md: &str, context: &str) {
    assert!(!md.trim().is_empty(), "[{context}] Markdown is empty");
    assert!(
        md.ends_with('\n'),
        "[{context}] Markdown must end with a newline"
    );

    let first_line = md.lines().next().unwrap_or("");
    assert!(
        !first_line.starts_with("```"),
        "[{context}] Output must not start with a code fence, got: {first_line:?}"
    );
    assert!(
        !md.contains("\n\n\n"),
        "[{context}] Output has runs of blank lines"
    );

    let invisible = ['\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}'];
    for ch in invisible {
        assert!(
            !md.contains(ch),
            "[{context}] Output contains invisible char U+{:04X}",
            ch as u32
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_inspect_scanned_pdf() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));

    let plan = inspect(pdf.to_string_lossy(), &e2e_config())
        .await
        .expect("inspect failed");

    assert_eq!(plan.document.kind, SourceKind::Pdf);
    assert!(plan.document.page_count > 0);
    let covered: usize = plan.units.iter().map(|r| r.len()).sum();
    assert_eq!(covered, plan.document.page_count);
    assert!(plan.units.iter().all(|r| r.len() <= 2));
}

#[tokio::test]
async fn e2e_password_on_unencrypted_pdf_is_ignored() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));

    let mut config = e2e_config();
    config.password = Some("not-needed".to_string());
    let plan = inspect(pdf.to_string_lossy(), &config)
        .await
        .expect("inspect with password failed");

    assert!(plan.document.page_count > 0);
}

#[tokio::test]
async fn e2e_convert_scanned_pdf() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("scanned.pdf"));

    let mut config = e2e_config();
    config.page_separator = PageSeparator::Comment;
    let output = convert(pdf.to_string_lossy(), &config)
        .await
        .expect("conversion failed");

    println!("{:#?}", output.stats);
    assert_eq!(output.document.status, DocumentStatus::Completed);
    let md = output.markdown().expect("merged markdown");
    assert_markdown_quality(md, "scanned.pdf");
    if output.stats.total_units > 1 {
        assert!(md.contains("<!-- page"), "separator missing");
    }
}

#[tokio::test]
async fn e2e_convert_image() {
    let png = e2e_skip_unless_ready!(test_cases_dir().join("receipt.png"));

    let output = convert(png.to_string_lossy(), &e2e_config())
        .await
        .expect("conversion failed");

    assert_eq!(output.stats.total_units, 1);
    assert_markdown_quality(output.markdown().expect("merged markdown"), "receipt.png");
}

#[tokio::test]
async fn e2e_tables_written_as_csv() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("tables.pdf"));
    let out = tempfile::tempdir().unwrap();

    let report = convert_to_dir(pdf.to_string_lossy(), out.path(), &e2e_config())
        .await
        .expect("conversion failed");

    assert!(report.markdown_path.is_some());
    assert!(!report.table_paths.is_empty(), "expected at least one table");
    for path in &report.table_paths {
        assert!(path.starts_with(out.path().join("tables_csv_tables")));
        let mut reader = csv::Reader::from_path(path).unwrap();
        let width = reader.headers().unwrap().len();
        for record in reader.records() {
            assert_eq!(record.unwrap().len(), width);
        }
    }
}
