//! Configuration types for document conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The collaborators the pipeline talks
//! to (engine, resource probe, page renderer, progress sink) can be injected
//! here; anything left unset is resolved to the production implementation
//! when the pipeline is built.

use crate::document::PageRange;
use crate::error::Ocr2MdError;
use crate::pipeline::engine::ExtractionEngine;
use crate::pipeline::probe::{ResourceProbe, TierThresholds};
use crate::pipeline::render::PageRenderer;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a document conversion.
///
/// # Example
/// ```rust
/// use edgequake_ocr2md::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .page_budget(6)
///     .max_retries(2)
///     .attempt_timeout_secs(300)
///     .build()
///     .unwrap();
/// assert_eq!(config.page_budget, 6);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Maximum pages per work unit. Default: 4.
    ///
    /// Smaller units fail and retry more cheaply; larger ones amortise the
    /// engine's start-up cost (model loading dominates short runs).
    pub page_budget: usize,

    /// Extra attempts after a transient failure. Default: 2 (three dispatches).
    pub max_retries: u32,

    /// Initial delay before a retry, doubled on every further retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Wall-clock limit for one engine dispatch, in seconds. Default: 600.
    pub attempt_timeout_secs: u64,

    /// Minimum free accelerator memory for the accelerated tier, in MB. Default: 500.
    pub accelerated_min_free_mb: u64,

    /// Accelerator temperature at or above which work falls back. Default: 85.
    pub accelerated_max_temp_c: u32,

    /// How long a resource snapshot stays fresh, in milliseconds. Default: 2000.
    pub probe_refresh_ms: u64,

    /// Worker-pool size. `None` sizes the pool from the tier detected at
    /// start-up: one worker per device when accelerated, a share of the CPU
    /// cores otherwise.
    pub concurrency: Option<usize>,

    /// Longest edge of a rendered page image, in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Engine executable. Default: `marker_single`.
    pub engine_command: String,

    /// Extra engine arguments. Default: `--force_ocr --output_format markdown`.
    pub engine_args: Vec<String>,

    /// Separator between unit fragments in the merged document. Default: none.
    pub page_separator: PageSeparator,

    /// Run table extraction on the merged document. Default: true.
    pub extract_tables: bool,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Pre-constructed engine. Takes precedence over `engine_command`.
    pub engine: Option<Arc<dyn ExtractionEngine>>,

    /// Pre-constructed resource probe. Defaults to a cached `nvidia-smi` probe.
    pub probe: Option<Arc<dyn ResourceProbe>>,

    /// Pre-constructed page renderer. Defaults to pdfium.
    pub renderer: Option<Arc<dyn PageRenderer>>,

    /// Per-unit progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            page_budget: 4,
            max_retries: 2,
            retry_backoff_ms: 500,
            attempt_timeout_secs: 600,
            accelerated_min_free_mb: 500,
            accelerated_max_temp_c: 85,
            probe_refresh_ms: 2000,
            concurrency: None,
            max_rendered_pixels: 2000,
            password: None,
            engine_command: "marker_single".to_string(),
            engine_args: vec![
                "--force_ocr".to_string(),
                "--output_format".to_string(),
                "markdown".to_string(),
            ],
            page_separator: PageSeparator::default(),
            extract_tables: true,
            download_timeout_secs: 120,
            engine: None,
            probe: None,
            renderer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("page_budget", &self.page_budget)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .field("accelerated_min_free_mb", &self.accelerated_min_free_mb)
            .field("accelerated_max_temp_c", &self.accelerated_max_temp_c)
            .field("concurrency", &self.concurrency)
            .field("engine_command", &self.engine_command)
            .field("engine_args", &self.engine_args)
            .field("engine", &self.engine.as_ref().map(|e| e.name().to_string()))
            .field("probe", &self.probe.as_ref().map(|_| "<dyn ResourceProbe>"))
            .field("renderer", &self.renderer.as_ref().map(|_| "<dyn PageRenderer>"))
            .field("page_separator", &self.page_separator)
            .field("extract_tables", &self.extract_tables)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn tier_thresholds(&self) -> TierThresholds {
        TierThresholds {
            min_free_mb: self.accelerated_min_free_mb,
            max_temp_c: self.accelerated_max_temp_c,
        }
    }
}

/// Builder for [`ConversionConfig`].
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl fmt::Debug for ConversionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ConversionConfigBuilder {
    pub fn page_budget(mut self, pages: usize) -> Self {
        self.config.page_budget = pages;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn attempt_timeout_secs(mut self, secs: u64) -> Self {
        self.config.attempt_timeout_secs = secs;
        self
    }

    pub fn accelerated_min_free_mb(mut self, mb: u64) -> Self {
        self.config.accelerated_min_free_mb = mb;
        self
    }

    pub fn accelerated_max_temp_c(mut self, c: u32) -> Self {
        self.config.accelerated_max_temp_c = c;
        self
    }

    pub fn probe_refresh_ms(mut self, ms: u64) -> Self {
        self.config.probe_refresh_ms = ms;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = Some(n.max(1));
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn engine_command(mut self, cmd: impl Into<String>) -> Self {
        self.config.engine_command = cmd.into();
        self
    }

    pub fn engine_args(mut self, args: Vec<String>) -> Self {
        self.config.engine_args = args;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn extract_tables(mut self, v: bool) -> Self {
        self.config.extract_tables = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ExtractionEngine>) -> Self {
        self.config.engine = Some(engine);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.config.probe = Some(probe);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.config.renderer = Some(renderer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Ocr2MdError> {
        let c = &self.config;
        if c.page_budget == 0 {
            return Err(Ocr2MdError::InvalidConfig(
                "Page budget must be ≥ 1".into(),
            ));
        }
        if c.attempt_timeout_secs == 0 {
            return Err(Ocr2MdError::InvalidConfig(
                "Attempt timeout must be ≥ 1s".into(),
            ));
        }
        if c.engine.is_none() && c.engine_command.trim().is_empty() {
            return Err(Ocr2MdError::InvalidConfig(
                "Engine command must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How to separate unit fragments in the merged Markdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No separator; fragments joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment naming the pages that follow: "<!-- pages 5-8 -->"
    Comment,
    /// Custom string inserted between fragments.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before the fragment covering `pages`.
    pub fn render(&self, pages: PageRange) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment if pages.len() == 1 => {
                format!("\n\n<!-- page {} -->\n\n", pages.start)
            }
            PageSeparator::Comment => format!("\n\n<!-- pages {} -->\n\n", pages),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ConversionConfig::default();
        assert_eq!(c.page_budget, 4);
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.engine_command, "marker_single");
        assert_eq!(c.tier_thresholds().min_free_mb, 500);
        assert_eq!(c.tier_thresholds().max_temp_c, 85);
        assert!(c.extract_tables);
    }

    #[test]
    fn builder_rejects_zero_budget() {
        let err = ConversionConfig::builder().page_budget(0).build().unwrap_err();
        assert!(err.to_string().contains("Page budget"));
    }

    #[test]
    fn builder_rejects_zero_timeout() {
        assert!(ConversionConfig::builder()
            .attempt_timeout_secs(0)
            .build()
            .is_err());
    }

    #[test]
    fn builder_clamps_concurrency() {
        let c = ConversionConfig::builder().concurrency(0).build().unwrap();
        assert_eq!(c.concurrency, Some(1));
    }

    #[test]
    fn separator_rendering() {
        let r = PageRange::new(5, 8);
        assert_eq!(PageSeparator::None.render(r), "\n\n");
        assert_eq!(PageSeparator::HorizontalRule.render(r), "\n\n---\n\n");
        assert_eq!(PageSeparator::Comment.render(r), "\n\n<!-- pages 5-8 -->\n\n");
        assert_eq!(
            PageSeparator::Comment.render(PageRange::new(3, 3)),
            "\n\n<!-- page 3 -->\n\n"
        );
        assert_eq!(
            PageSeparator::Custom("***".into()).render(r),
            "\n\n***\n\n"
        );
    }
}
