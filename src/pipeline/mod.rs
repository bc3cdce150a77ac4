//! Pipeline stages for OCR-to-Markdown conversion.
//!
//! Each submodule implements one step. The engine, probe and renderer sit
//! behind traits so tests (and embedders) can swap them without touching the
//! orchestration in [`crate::convert`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ planner ──▶ render ──▶ invoker ──▶ postprocess ──▶ planner ──▶ tables
//! (sniff)   (split)    (pdfium)   (engine +    (cleanup)      (merge)    (CSV)
//!                                  probe)
//! ```
//!
//! 1. [`input`]: canonicalise the path or URL; PDF vs image by magic bytes
//! 2. [`planner`]: slice into page-range units, and merge their fragments back
//! 3. [`render`]: rasterise a unit's pages; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 4. [`probe`]: read accelerator memory and temperature, pick a tier
//! 5. [`engine`]: run the external OCR engine once for one unit
//! 6. [`invoker`]: drive the engine with timeout, retry and tier escalation
//! 7. [`postprocess`]: deterministic cleanup of each fragment
//! 8. [`tables`]: find Markdown tables and normalise them into records

pub mod engine;
pub mod input;
pub mod invoker;
pub mod planner;
pub mod postprocess;
pub mod probe;
pub mod render;
pub mod tables;
