//! Progress-callback trait for per-unit conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline dispatches each work unit.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ocr2md::{ConversionProgressCallback, ConversionConfig, ExecutionTier};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl ConversionProgressCallback for CountingCallback {
//!     fn on_unit_complete(&self, index: usize, total: usize, markdown_len: usize, tier: ExecutionTier) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Unit {}/{} done on {} ({} bytes)", index + 1, total, tier, markdown_len);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(counter as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::document::PageRange;
use crate::pipeline::engine::FailureCategory;
use crate::pipeline::probe::ExecutionTier;
use std::sync::Arc;

/// Called by the conversion pipeline as it processes each work unit.
///
/// Units run concurrently, so every method except the start/complete pair may
/// be called from several tasks at once. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once after planning, before any unit is dispatched.
    ///
    /// # Arguments
    /// * `total_units`: number of units that will be dispatched (resumed
    ///   units excluded)
    fn on_conversion_start(&self, total_units: usize) {
        let _ = total_units;
    }

    /// Called just before a unit's pages are rendered.
    fn on_unit_start(&self, index: usize, pages: PageRange, total_units: usize) {
        let _ = (index, pages, total_units);
    }

    /// Called before a retry, with the category of the failure that caused it.
    ///
    /// # Arguments
    /// * `attempt`: the attempt about to be made (2 for the first retry)
    fn on_unit_retry(&self, index: usize, attempt: u32, category: FailureCategory) {
        let _ = (index, attempt, category);
    }

    /// Called when a unit succeeds.
    ///
    /// # Arguments
    /// * `markdown_len`: byte length of the cleaned fragment
    /// * `tier`: tier of the successful attempt
    fn on_unit_complete(
        &self,
        index: usize,
        total_units: usize,
        markdown_len: usize,
        tier: ExecutionTier,
    ) {
        let _ = (index, total_units, markdown_len, tier);
    }

    /// Called when a unit reaches FAILED or is cancelled.
    fn on_unit_error(&self, index: usize, total_units: usize, error: &str) {
        let _ = (index, total_units, error);
    }

    /// Called once after every unit has a terminal result.
    fn on_conversion_complete(&self, total_units: usize, success_count: usize) {
        let _ = (total_units, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
