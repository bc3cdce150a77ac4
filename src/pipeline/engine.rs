//! The external extraction capability, invoked as a black box.
//!
//! [`ExtractionEngine`] is the seam: the pipeline hands it rendered page
//! images plus a tier hint and gets Markdown back, or a categorised
//! [`EngineFailure`]. [`MarkerCliEngine`] drives the `marker_single` CLI as a
//! child process; tests plug in an in-process fake.
//!
//! Timeouts are applied by the caller. Dropping the future returned by
//! [`ExtractionEngine::extract`] kills the child process (`kill_on_drop`).

use crate::document::PageRange;
use crate::pipeline::probe::ExecutionTier;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One engine call: the unit's images in page order.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub unit_index: usize,
    pub pages: PageRange,
    pub images: Vec<PathBuf>,
    pub tier: ExecutionTier,
    /// Fresh, empty directory for this attempt's output.
    pub output_dir: PathBuf,
}

/// Successful engine output.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub markdown: String,
    pub stdout: String,
    pub stderr: String,
}

/// Why an engine call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// No result within the per-attempt timeout.
    Timeout,
    /// The process exited non-zero for no recognisable reason.
    NonZeroExit,
    /// Out of device memory or similar contention.
    ResourceExhausted,
    /// The process succeeded but no Markdown could be found or read.
    MalformedOutput,
    /// The process could not be started for a reason other than a missing binary.
    SpawnFailed,
    /// The engine binary does not exist.
    EngineMissing,
    /// The engine could not read the input file.
    InvalidInput,
    /// The engine read the input but cannot handle its content.
    UnsupportedContent,
}

impl FailureCategory {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::EngineMissing | Self::InvalidInput | Self::UnsupportedContent
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::NonZeroExit => "non-zero exit",
            Self::ResourceExhausted => "resource exhausted",
            Self::MalformedOutput => "malformed output",
            Self::SpawnFailed => "spawn failed",
            Self::EngineMissing => "engine missing",
            Self::InvalidInput => "invalid input",
            Self::UnsupportedContent => "unsupported content",
        };
        f.write_str(s)
    }
}

/// A structured engine failure: category plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl EngineFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// An OCR/layout engine that turns page images into Markdown.
pub trait ExtractionEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn extract<'a>(
        &'a self,
        request: &'a EngineRequest,
    ) -> BoxFuture<'a, Result<EngineOutput, EngineFailure>>;
}

/// Runs the `marker_single` CLI once per image and concatenates the results.
#[derive(Debug, Clone)]
pub struct MarkerCliEngine {
    program: String,
    args: Vec<String>,
}

impl MarkerCliEngine {
    /// `args` are passed after `<image> --output_dir <dir>`; any
    /// `--output_dir` among them is dropped since every attempt gets its own.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args: strip_output_dir_flag(args),
        }
    }

    async fn run_one(
        &self,
        image: &Path,
        request: &EngineRequest,
    ) -> Result<EngineOutput, EngineFailure> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(image)
            .arg("--output_dir")
            .arg(&request.output_dir)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match request.tier {
            ExecutionTier::Accelerated => {
                cmd.env("TORCH_DEVICE", "cuda");
            }
            ExecutionTier::Fallback => {
                cmd.env("TORCH_DEVICE", "cpu").env("CUDA_VISIBLE_DEVICES", "");
            }
        }

        info!(
            unit = request.unit_index,
            tier = %request.tier,
            "Starting {} for {}",
            self.program,
            image.display()
        );
        let start = Instant::now();

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineFailure::new(
                    FailureCategory::EngineMissing,
                    format!("'{}' not found on PATH", self.program),
                )
            } else {
                EngineFailure::new(FailureCategory::SpawnFailed, e.to_string())
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        info!(
            unit = request.unit_index,
            "{} finished for {} ({}) in {:.2}s",
            self.program,
            image.display(),
            output.status,
            start.elapsed().as_secs_f64()
        );
        debug!("{} stdout:\n{}", self.program, or_placeholder(&stdout, "<no stdout>"));
        debug!("{} stderr:\n{}", self.program, or_placeholder(&stderr, "<no stderr>"));

        if !output.status.success() {
            let category = classify_stderr(&stderr);
            warn!(
                unit = request.unit_index,
                %category,
                "{} failed for {} ({})",
                self.program,
                image.display(),
                output.status
            );
            return Err(EngineFailure::new(category, last_lines(&stderr, 5)));
        }

        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let md_path = discover_markdown(&request.output_dir, &stem, &stdout, &stderr)
            .ok_or_else(|| {
                EngineFailure::new(
                    FailureCategory::MalformedOutput,
                    format!("no markdown output found for {}", image.display()),
                )
            })?;
        debug!("Discovered engine output at {}", md_path.display());

        let markdown = tokio::fs::read_to_string(&md_path).await.map_err(|e| {
            EngineFailure::new(
                FailureCategory::MalformedOutput,
                format!("cannot read {}: {}", md_path.display(), e),
            )
        })?;

        Ok(EngineOutput {
            markdown,
            stdout,
            stderr,
        })
    }
}

impl ExtractionEngine for MarkerCliEngine {
    fn name(&self) -> &str {
        &self.program
    }

    fn extract<'a>(
        &'a self,
        request: &'a EngineRequest,
    ) -> BoxFuture<'a, Result<EngineOutput, EngineFailure>> {
        Box::pin(async move {
            if request.images.is_empty() {
                return Err(EngineFailure::new(
                    FailureCategory::InvalidInput,
                    "unit has no images",
                ));
            }
            let mut combined = EngineOutput::default();
            for image in &request.images {
                let out = self.run_one(image, request).await?;
                if !combined.markdown.is_empty() {
                    combined.markdown.push_str("\n\n");
                }
                combined.markdown.push_str(out.markdown.trim_end());
                combined.stdout.push_str(&out.stdout);
                combined.stderr.push_str(&out.stderr);
            }
            Ok(combined)
        })
    }
}

fn strip_output_dir_flag(args: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "--output_dir" {
            skip_value = true;
            continue;
        }
        if arg.starts_with("--output_dir=") {
            continue;
        }
        kept.push(arg);
    }
    kept
}

fn or_placeholder<'a>(s: &'a str, placeholder: &'a str) -> &'a str {
    if s.trim().is_empty() {
        placeholder
    } else {
        s
    }
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Map engine stderr to a failure category.
pub fn classify_stderr(stderr: &str) -> FailureCategory {
    let s = stderr.to_lowercase();
    if s.contains("out of memory") || s.contains("cuda error") || s.contains("cudnn_status") {
        FailureCategory::ResourceExhausted
    } else if s.contains("cannot identify image")
        || s.contains("unidentifiedimageerror")
        || s.contains("not a valid")
        || s.contains("invalid pdf")
        || s.contains("no such file")
    {
        FailureCategory::InvalidInput
    } else if s.contains("unsupported") {
        FailureCategory::UnsupportedContent
    } else {
        FailureCategory::NonZeroExit
    }
}

static RE_MD_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_:\\/.\- ]+\.md").unwrap());

/// Locate the Markdown the engine wrote.
///
/// Order: `<dir>/<stem>/<stem>.md`, `<dir>/<stem>.md`, newest `.md` under
/// `dir` whose name starts with `stem`, newest `.md` under `dir`, then any
/// existing `.md` path mentioned in the process output.
pub fn discover_markdown(dir: &Path, stem: &str, stdout: &str, stderr: &str) -> Option<PathBuf> {
    let canonical = [
        dir.join(stem).join(format!("{stem}.md")),
        dir.join(format!("{stem}.md")),
    ];
    if let Some(p) = canonical.into_iter().find(|p| p.is_file()) {
        return Some(p);
    }

    let mut found = Vec::new();
    collect_markdown(dir, 3, &mut found);
    found.sort_by_key(|p| {
        std::cmp::Reverse(
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });
    let stem_match = found.iter().find(|p| {
        p.file_name()
            .map(|n| n.to_string_lossy().starts_with(stem))
            .unwrap_or(false)
    });
    if let Some(p) = stem_match.or(found.first()) {
        return Some(p.clone());
    }

    // Paths may contain spaces, so a match like "Saved to /a b/x.md" is
    // tried whole and from every space onward.
    let text = format!("{stdout}\n{stderr}");
    RE_MD_PATH.find_iter(&text).find_map(|m| {
        let s = m.as_str().trim();
        std::iter::once(s)
            .chain(s.match_indices(' ').map(|(i, _)| &s[i + 1..]))
            .map(PathBuf::from)
            .find(|p| p.is_file())
    })
}

fn collect_markdown(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth > 0 {
                collect_markdown(&path, depth - 1, out);
            }
        } else if path.extension().is_some_and(|e| e == "md") {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn output_dir_flag_is_stripped() {
        let args = vec![
            "--force_ocr".to_string(),
            "--output_dir".to_string(),
            "/tmp/elsewhere".to_string(),
            "--output_dir=/tmp/x".to_string(),
            "--output_format".to_string(),
            "markdown".to_string(),
        ];
        assert_eq!(
            strip_output_dir_flag(args),
            vec!["--force_ocr", "--output_format", "markdown"]
        );
    }

    #[test]
    fn classifies_stderr() {
        assert_eq!(
            classify_stderr("RuntimeError: CUDA out of memory. Tried to allocate"),
            FailureCategory::ResourceExhausted
        );
        assert_eq!(
            classify_stderr("PIL.UnidentifiedImageError: cannot identify image file"),
            FailureCategory::InvalidInput
        );
        assert_eq!(
            classify_stderr("ValueError: Unsupported page content"),
            FailureCategory::UnsupportedContent
        );
        assert_eq!(classify_stderr("Segmentation fault"), FailureCategory::NonZeroExit);
    }

    #[test]
    fn retryability() {
        assert!(FailureCategory::Timeout.is_retryable());
        assert!(FailureCategory::MalformedOutput.is_retryable());
        assert!(FailureCategory::ResourceExhausted.is_retryable());
        assert!(!FailureCategory::InvalidInput.is_retryable());
        assert!(!FailureCategory::EngineMissing.is_retryable());
    }

    #[test]
    fn discovers_canonical_output() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("page_0001");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("page_0001.md"), "# hi").unwrap();
        let found = discover_markdown(dir.path(), "page_0001", "", "").unwrap();
        assert_eq!(found, nested.join("page_0001.md"));
    }

    #[test]
    fn discovers_renamed_output_by_walking() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("out").join("whatever");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("result.md"), "text").unwrap();
        let found = discover_markdown(dir.path(), "page_0001", "", "").unwrap();
        assert_eq!(found, nested.join("result.md"));
    }

    #[test]
    fn discovers_path_mentioned_in_stdout() {
        let out_dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let md = other.path().join("elsewhere.md");
        std::fs::write(&md, "text").unwrap();
        let stdout = format!("Saved markdown to {}\n", md.display());
        let found = discover_markdown(out_dir.path(), "page_0001", &stdout, "").unwrap();
        assert_eq!(found, md);
    }

    #[test]
    fn nothing_found() {
        let dir = TempDir::new().unwrap();
        assert!(discover_markdown(dir.path(), "x", "done", "").is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_fatal() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("page_0001.png");
        std::fs::write(&img, b"fake").unwrap();
        let engine = MarkerCliEngine::new("definitely-not-marker-single", vec![]);
        let req = EngineRequest {
            unit_index: 0,
            pages: PageRange::new(1, 1),
            images: vec![img],
            tier: ExecutionTier::Fallback,
            output_dir: dir.path().join("out"),
        };
        let err = engine.extract(&req).await.unwrap_err();
        assert_eq!(err.category, FailureCategory::EngineMissing);
        assert!(!err.category.is_retryable());
    }
}
