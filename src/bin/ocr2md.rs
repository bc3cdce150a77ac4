//! CLI binary for edgequake-ocr2md.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig`, wires Ctrl-C to cancellation and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_ocr2md::pipeline::{input, tables};
use edgequake_ocr2md::{
    extract_tables_from_file, inspect, load_unit_results, write_artifacts, CancelToken,
    ConversionConfig, ConversionOutput, ConversionProgressCallback, ExecutionTier,
    FailureCategory, PageRange, PageSeparator, Pipeline, ProgressCallback, UnitResult,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a live bar plus one log line per unit. Units
/// finish out of order, so start times are keyed by unit index.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until `on_conversion_start` reports the unit count.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} units  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_units: usize) {
        self.activate_bar(total_units);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Dispatching {total_units} units…"))
        ));
    }

    fn on_unit_start(&self, index: usize, pages: PageRange, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(format!("pages {pages}"));
    }

    fn on_unit_retry(&self, index: usize, attempt: u32, category: FailureCategory) {
        self.bar.println(format!(
            "  {} Unit {:>3}  {}",
            yellow("↻"),
            index + 1,
            dim(&format!("attempt {attempt} after {category}")),
        ));
    }

    fn on_unit_complete(
        &self,
        index: usize,
        total: usize,
        markdown_len: usize,
        tier: ExecutionTier,
    ) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Unit {:>3}/{:<3}  {:<8}  {:<11}  {}",
            green("✓"),
            index + 1,
            total,
            dim(&format!("{markdown_len:>6} chars")),
            dim(&tier.to_string()),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_unit_error(&self, index: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(index);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Unit {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_units: usize, success_count: usize) {
        let failed = total_units.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} units converted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} units converted  ({} failed)",
                if failed == total_units {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_units,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a scan, Markdown on stdout
  ocr2md scan.pdf

  # Write scan.md and tables_csv_scan/table_N.csv into out/
  ocr2md scan.pdf -o out/

  # Smaller chunks and more retries for a flaky GPU
  ocr2md --page-budget 2 --max-retries 4 book.pdf -o out/

  # Pick up where an interrupted run stopped
  ocr2md --resume book.pdf -o out/

  # Show the unit plan without running the engine
  ocr2md --inspect-only book.pdf

  # Extract tables from Markdown you already have
  ocr2md --tables-from report.md -o out/

ENVIRONMENT VARIABLES:
  MARKER_CLI              OCR engine executable (default: marker_single)
  MARKER_FLAGS            Engine flags, whitespace separated
  GPU_MEM_FREE_MB         Free accelerator memory required for GPU runs (default: 500)
  GPU_TEMP_THRESHOLD_C    Accelerator temperature ceiling in °C (default: 85)
  OCR2MD_*                Every other flag, e.g. OCR2MD_PAGE_BUDGET=8
  RUST_LOG                Override the log filter

SETUP:
  1. Install the engine:  pip install marker-pdf
  2. Convert:             ocr2md scan.pdf -o out/

  PDF pages are rasterised with pdfium; libpdfium must be in the working
  directory or on the system library path. Image inputs skip pdfium.
"#;

/// Convert scanned PDFs and images to Markdown with an external OCR engine.
#[derive(Parser, Debug)]
#[command(
    name = "ocr2md",
    version,
    about = "Convert scanned PDFs and images to Markdown with an external OCR engine",
    long_about = "Convert PDFs and images (local files or URLs) to Markdown by running an OCR \
engine such as marker over small page-range chunks. Chunks are retried on failure, moved from \
the GPU to the CPU when the accelerator is short of memory or too hot, and merged back in page \
order. Markdown tables are exported as CSV.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF/image path or HTTP/HTTPS URL.
    #[arg(required_unless_present = "tables_from")]
    input: Option<String>,

    /// Write artifacts into this directory instead of printing Markdown.
    #[arg(short, long, env = "OCR2MD_OUTPUT_DIR")]
    output: Option<PathBuf>,

    /// Maximum pages per work unit.
    #[arg(long, env = "OCR2MD_PAGE_BUDGET", default_value_t = 4)]
    page_budget: usize,

    /// Retries per unit after the first attempt.
    #[arg(long, env = "OCR2MD_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Base backoff between attempts in milliseconds (doubles per retry).
    #[arg(long, env = "OCR2MD_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Per-attempt engine timeout in seconds.
    #[arg(long, env = "OCR2MD_TIMEOUT", default_value_t = 600)]
    timeout: u64,

    /// Concurrent units. Derived from the detected tier when unset.
    #[arg(short, long, env = "OCR2MD_CONCURRENCY")]
    concurrency: Option<usize>,

    /// OCR engine executable.
    #[arg(long, env = "MARKER_CLI", default_value = "marker_single")]
    engine: String,

    /// Engine flags, whitespace separated.
    #[arg(
        long,
        env = "MARKER_FLAGS",
        default_value = "--force_ocr --output_format markdown",
        allow_hyphen_values = true
    )]
    engine_flags: String,

    /// Free accelerator memory (MiB) required for the accelerated tier.
    #[arg(long, env = "GPU_MEM_FREE_MB", default_value_t = 500)]
    gpu_min_free_mb: u64,

    /// Accelerator temperature (°C) at or above which the fallback tier is used.
    #[arg(long, env = "GPU_TEMP_THRESHOLD_C", default_value_t = 85)]
    gpu_max_temp_c: u32,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "OCR2MD_SEPARATOR", default_value = "none")]
    separator: String,

    /// Skip table extraction.
    #[arg(long, env = "OCR2MD_NO_TABLES")]
    no_tables: bool,

    /// Extract tables from an existing Markdown file and exit.
    #[arg(long, value_name = "FILE.md", conflicts_with = "inspect_only")]
    tables_from: Option<PathBuf>,

    /// Print the document kind, page count and unit plan, no conversion.
    #[arg(long)]
    inspect_only: bool,

    /// Reuse units saved by an earlier incomplete run in the output directory.
    #[arg(long, env = "OCR2MD_RESUME", requires = "output")]
    resume: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "OCR2MD_PASSWORD")]
    password: Option<String>,

    /// Output structured JSON instead of Markdown.
    #[arg(long, env = "OCR2MD_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "OCR2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OCR2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OCR2MD_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "OCR2MD_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && cli.tables_from.is_none();
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Table-only mode ──────────────────────────────────────────────────
    if let Some(ref md_path) = cli.tables_from {
        return run_tables_from(&cli, md_path).await;
    }

    let input_str = cli
        .input
        .clone()
        .context("An input path or URL is required")?;

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let config = build_config(&cli, None)?;
        let plan = inspect(&input_str, &config)
            .await
            .context("Failed to inspect input")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&plan).context("Failed to serialise plan")?
            );
        } else {
            println!("File:         {}", input_str);
            println!("Kind:         {}", plan.document.kind);
            println!("Pages:        {}", plan.document.page_count);
            println!("Units:        {}", plan.units.len());
            for (i, pages) in plan.units.iter().enumerate() {
                println!("  {:>4}  pages {}", i + 1, pages);
            }
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Ctrl-C → cancel ──────────────────────────────────────────────────
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", yellow("Interrupted, finishing in-flight units…"));
                cancel.cancel();
            }
        });
    }

    // ── Run conversion ───────────────────────────────────────────────────
    let resolved = input::resolve_input(&input_str, cli.download_timeout)
        .await
        .context("Failed to resolve input")?;
    let pipeline = Pipeline::new(&config);
    let document = pipeline
        .open(resolved.path())
        .await
        .context("Failed to open document")?;

    let prior = match (&cli.output, cli.resume) {
        (Some(out_dir), true) => load_prior(out_dir, &document.stem()).await?,
        _ => Vec::new(),
    };

    let output = pipeline
        .run(document, &cancel, &prior)
        .await
        .context("Conversion failed")?;

    match cli.output {
        Some(ref out_dir) => {
            let report = write_artifacts(&output, out_dir)
                .await
                .context("Failed to write artifacts")?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise report")?
                );
            } else if !cli.quiet {
                print_summary(&output);
                if let Some(ref p) = report.markdown_path {
                    eprintln!("   →  {}", bold(&p.display().to_string()));
                }
                if !report.table_paths.is_empty() {
                    eprintln!(
                        "   →  {} tables in {}",
                        report.table_paths.len(),
                        bold(&out_dir.display().to_string())
                    );
                }
                if let Some(ref p) = report.units_path {
                    eprintln!(
                        "   {} rerun with --resume to retry only the failed units ({})",
                        dim("hint:"),
                        p.display()
                    );
                }
            }
        }
        None => {
            if cli.json {
                let json =
                    serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
                println!("{json}");
            } else if let Some(md) = output.markdown() {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(md.as_bytes())
                    .context("Failed to write to stdout")?;
            }
            if !cli.quiet && !cli.json {
                print_summary(&output);
            }
        }
    }

    if !output.is_complete() {
        let pages: Vec<String> = output
            .failed_ranges
            .iter()
            .map(|f| f.pages.to_string())
            .collect();
        anyhow::bail!(
            "{} of {} units did not complete (pages {})",
            output.failed_ranges.len(),
            output.stats.total_units,
            pages.join(", ")
        );
    }

    Ok(())
}

/// `--tables-from`: extract, then print a summary or write CSVs.
async fn run_tables_from(cli: &Cli, md_path: &Path) -> Result<()> {
    let extraction = extract_tables_from_file(md_path)
        .await
        .with_context(|| format!("Failed to extract tables from {}", md_path.display()))?;

    for skipped in &extraction.skipped {
        warn!("{}", skipped);
    }

    if let Some(ref out_dir) = cli.output {
        let stem = md_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let dir = out_dir.join(format!("tables_csv_{stem}"));
        let written = tables::write_tables_csv(&extraction.tables, &dir)
            .context("Failed to write CSV files")?;
        if !cli.quiet {
            eprintln!(
                "{} {} tables  →  {}",
                green("✔"),
                written.len(),
                bold(&dir.display().to_string())
            );
        }
    } else if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&extraction.tables)
                .context("Failed to serialise tables")?
        );
    } else {
        for (i, t) in extraction.tables.iter().enumerate() {
            println!(
                "table {}: {} columns × {} rows  [{}]",
                i + 1,
                t.column_count(),
                t.row_count(),
                t.columns.join(", ")
            );
        }
        if extraction.tables.is_empty() && !cli.quiet {
            eprintln!("{}", dim("No tables found"));
        }
    }
    Ok(())
}

/// Unit results saved next to the artifacts by an earlier incomplete run.
async fn load_prior(out_dir: &Path, stem: &str) -> Result<Vec<UnitResult>> {
    let path = out_dir.join(format!("{stem}.units.json"));
    if !path.exists() {
        return Ok(Vec::new());
    }
    let prior = load_unit_results(&path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?;
    eprintln!(
        "{} resuming with {} saved units from {}",
        cyan("◆"),
        prior.iter().filter(|r| r.succeeded()).count(),
        path.display()
    );
    Ok(prior)
}

fn print_summary(output: &ConversionOutput) {
    let s = &output.stats;
    eprintln!(
        "{}  {}/{} units  {} pages  {} tables  {}ms",
        if output.is_complete() {
            green("✔")
        } else {
            cyan("⚠")
        },
        s.succeeded_units,
        s.total_units,
        s.total_pages,
        output.tables.len(),
        s.total_duration_ms,
    );
    eprintln!(
        "   {}",
        dim(&format!(
            "{} attempts  /  {} on gpu  /  {} on cpu  /  {} resumed",
            s.total_attempts, s.accelerated_units, s.fallback_units, s.resumed_units
        )),
    );
    for f in &output.failed_ranges {
        eprintln!("   {} pages {}: {}", red("✗"), f.pages, f.error);
    }
}

/// Map CLI args to `ConversionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let mut builder = ConversionConfig::builder()
        .page_budget(cli.page_budget)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .attempt_timeout_secs(cli.timeout)
        .accelerated_min_free_mb(cli.gpu_min_free_mb)
        .accelerated_max_temp_c(cli.gpu_max_temp_c)
        .engine_command(cli.engine.clone())
        .engine_args(cli.engine_flags.split_whitespace().map(String::from).collect())
        .page_separator(parse_separator(&cli.separator))
        .extract_tables(!cli.no_tables)
        .download_timeout_secs(cli.download_timeout);

    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
