//! Streaming conversion API: emit unit results as they complete.
//!
//! Large documents take minutes. Streaming lets callers show partial results
//! immediately, drive progress bars, or persist each unit as it lands instead
//! of waiting for the whole document.
//!
//! Unlike the eager [`crate::convert::convert`], which returns only after
//! every unit has a terminal result, [`convert_stream`] yields each
//! [`UnitResult`] as soon as it is ready. Units run concurrently, so results
//! arrive in completion order; sort by `index` (or hand them to
//! [`crate::pipeline::planner::ChunkPlanner::merge`]) when order matters.

use crate::cancel::CancelToken;
use crate::config::ConversionConfig;
use crate::convert::{document_unit_total, scratch_dir, Pipeline};
use crate::document::Document;
use crate::error::Ocr2MdError;
use crate::output::UnitResult;
use crate::pipeline::input::{self, ResolvedInput};
use futures::future;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of unit results, failures included.
pub type UnitStream = Pin<Box<dyn Stream<Item = UnitResult> + Send>>;

/// Everything the in-flight units borrow. Dropped with the last future,
/// which removes the scratch directory and any downloaded input.
struct StreamContext {
    pipeline: Pipeline,
    document: Document,
    scratch: TempDir,
    cancel: CancelToken,
    _input: ResolvedInput,
}

/// Convert a PDF or image, streaming unit results as they are ready.
///
/// The progress callback, if any, sees `on_conversion_start` before the
/// first unit and `on_conversion_complete` once the stream is exhausted.
///
/// # Returns
/// - `Ok(UnitStream)`: one item per work unit, in completion order
/// - `Err(Ocr2MdError)`: fatal error (file not found, unsupported format,
///   unreadable PDF)
///
/// # Example
/// ```rust,no_run
/// use edgequake_ocr2md::{convert_stream, ConversionConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ConversionConfig::default();
/// let mut stream = convert_stream("scan.pdf", &config).await?;
/// while let Some(unit) = stream.next().await {
///     match unit.error {
///         None => println!("pages {}: {} bytes", unit.pages, unit.markdown.len()),
///         Some(e) => eprintln!("pages {} failed: {}", unit.pages, e),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub async fn convert_stream(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
) -> Result<UnitStream, Ocr2MdError> {
    convert_stream_cancellable(input_str, config, CancelToken::new()).await
}

/// [`convert_stream`] with a cancellation token.
///
/// After `cancel` fires, in-flight units end with
/// [`crate::error::UnitError::Cancelled`] and units not yet started are
/// yielded as cancelled without running.
pub async fn convert_stream_cancellable(
    input_str: impl AsRef<str>,
    config: &ConversionConfig,
    cancel: CancelToken,
) -> Result<UnitStream, Ocr2MdError> {
    let input_str = input_str.as_ref();
    info!("Starting streaming conversion: {}", input_str);

    // ── Resolve and plan ─────────────────────────────────────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let pipeline = Pipeline::new(config);
    let document = pipeline.open(resolved.path()).await?;
    let units = pipeline.planner().split(&document)?;
    let workers = pipeline.worker_count().await;

    let total_units = units.len();
    let callback = config.progress_callback.clone();
    if let Some(ref cb) = callback {
        cb.on_conversion_start(total_units);
    }

    let ctx = Arc::new(StreamContext {
        pipeline,
        document,
        scratch: scratch_dir()?,
        cancel,
        _input: resolved,
    });

    // ── Build the stream ─────────────────────────────────────────────────
    let s = stream::iter(units.into_iter().map(move |unit| {
        let ctx = Arc::clone(&ctx);
        async move {
            let total = document_unit_total(&ctx.document, ctx.pipeline.planner());
            ctx.pipeline
                .process_unit(unit, ctx.scratch.path(), &ctx.cancel, total)
                .await
        }
    }))
    .buffer_unordered(workers);

    // ── Report the end of the run ────────────────────────────────────────
    let successes = Arc::new(AtomicUsize::new(0));
    let counted = s.inspect({
        let successes = Arc::clone(&successes);
        move |r| {
            if r.succeeded() {
                successes.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
    let finish = stream::once(async move {
        if let Some(cb) = callback {
            cb.on_conversion_complete(total_units, successes.load(Ordering::Relaxed));
        }
        None::<UnitResult>
    })
    .filter_map(future::ready);

    Ok(Box::pin(counted.chain(finish)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let config = ConversionConfig::default();
        let err = convert_stream("/nonexistent/scan.pdf", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Ocr2MdError::FileNotFound { .. }));
    }
}
