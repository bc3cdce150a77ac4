//! PDF rasterisation: turn a unit's page range into PNG files for the engine.
//!
//! The engine reads images from disk, so each unit's pages are rendered into
//! the run's scratch directory as `page_0001.png`, `page_0002.png`, …; the
//! zero-padded page number keeps directory order equal to page order.
//!
//! pdfium is not async-safe. [`PageRenderer`] is a blocking trait and callers
//! run it inside `tokio::task::spawn_blocking`.

use crate::document::PageRange;
use crate::error::Ocr2MdError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reads page counts and renders page ranges. Blocking.
pub trait PageRenderer: Send + Sync {
    /// Number of pages, or `InvalidDocument` if the file cannot be opened.
    fn page_count(&self, path: &Path) -> Result<usize, Ocr2MdError>;

    /// Render `pages` into `out_dir`, returning the image paths in page order.
    fn render(&self, path: &Path, pages: PageRange, out_dir: &Path)
        -> Result<Vec<PathBuf>, String>;
}

/// File name for a rendered page (1-indexed).
pub fn page_image_name(page: usize) -> String {
    format!("page_{page:04}.png")
}

/// pdfium-backed renderer.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    max_pixels: u32,
    password: Option<String>,
}

impl PdfiumRenderer {
    pub fn new(max_pixels: u32, password: Option<String>) -> Self {
        Self {
            max_pixels,
            password,
        }
    }

    /// The password is borrowed for the document's lifetime, so the
    /// document cannot outlive `self`.
    fn open<'a>(
        &'a self,
        pdfium: &'a Pdfium,
        path: &Path,
    ) -> Result<PdfDocument<'a>, Ocr2MdError> {
        pdfium
            .load_pdf_from_file(path, self.password.as_deref())
            .map_err(|e| {
                let err_str = format!("{:?}", e);
                if err_str.contains("Password") || err_str.contains("password") {
                    if self.password.is_some() {
                        Ocr2MdError::WrongPassword {
                            path: path.to_path_buf(),
                        }
                    } else {
                        Ocr2MdError::PasswordRequired {
                            path: path.to_path_buf(),
                        }
                    }
                } else {
                    Ocr2MdError::InvalidDocument {
                        path: path.to_path_buf(),
                        detail: err_str,
                    }
                }
            })
    }
}

impl PageRenderer for PdfiumRenderer {
    fn page_count(&self, path: &Path) -> Result<usize, Ocr2MdError> {
        let pdfium = Pdfium::default();
        let document = self.open(&pdfium, path)?;
        let count = document.pages().len() as usize;
        info!("PDF loaded: {} pages", count);
        Ok(count)
    }

    fn render(
        &self,
        path: &Path,
        pages: PageRange,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, String> {
        let pdfium = Pdfium::default();
        let document = self.open(&pdfium, path).map_err(|e| e.to_string())?;
        let doc_pages = document.pages();
        let total = doc_pages.len() as usize;
        if pages.end > total {
            return Err(format!(
                "pages {} out of range (document has {} pages)",
                pages, total
            ));
        }

        std::fs::create_dir_all(out_dir)
            .map_err(|e| format!("cannot create {}: {}", out_dir.display(), e))?;

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let mut images = Vec::with_capacity(pages.len());
        for idx in pages.zero_based() {
            let page = doc_pages
                .get(idx as u16)
                .map_err(|e| format!("page {}: {:?}", idx + 1, e))?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| format!("page {}: {:?}", idx + 1, e))?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );

            let target = out_dir.join(page_image_name(idx + 1));
            image
                .save_with_format(&target, image::ImageFormat::Png)
                .map_err(|e| format!("page {}: cannot write PNG: {}", idx + 1, e))?;
            images.push(target);
        }

        Ok(images)
    }
}
