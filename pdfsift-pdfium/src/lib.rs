use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use pdfsift_core::{
    document_id_for_path, CharacterExtractor, DocumentId, DocumentTextProvider, ExtractionError,
    PageChar, PageRect,
};
use tracing::{debug, warn};

/// Opens documents for text search through a shared Pdfium binding.
pub struct PdfiumTextFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumTextFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }

    pub fn open_document(&self, path: &Path) -> Result<Arc<PdfiumTextDocument>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let probe = self
            .pdfium
            .load_pdf_from_file(&absolute, None)
            .with_context(|| format!("failed to open {:?}", absolute))?;
        let page_count = usize::from(probe.pages().len());
        drop(probe);

        let id = document_id_for_path(&absolute);
        debug!(document = %id, pages = page_count, path = %absolute.display(), "opened document for search");
        Ok(Arc::new(PdfiumTextDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            id,
            page_count,
        )))
    }
}

#[async_trait]
impl DocumentTextProvider for PdfiumTextFactory {
    async fn open(&self, path: &Path) -> Result<Arc<dyn CharacterExtractor>> {
        let document = self.open_document(path)?;
        Ok(document as Arc<dyn CharacterExtractor>)
    }
}

/// One opened PDF exposed as a character source. The underlying document is
/// opened lazily and kept for reuse across pages; extraction hands out plain
/// owned `PageChar` values, never native handles.
pub struct PdfiumTextDocument {
    // Declared before `pdfium` so it drops first; see SAFETY below.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    id: DocumentId,
    page_count: usize,
}

impl PdfiumTextDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, id: DocumentId, page_count: usize) -> Self {
        Self {
            document: Mutex::new(None),
            pdfium,
            path,
            id,
            page_count,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page dimensions in points, for coordinate transforms.
    pub fn page_size(&self, page_number: usize) -> Result<(f64, f64), ExtractionError> {
        self.with_document(|document| {
            let page = self.page(document, page_number)?;
            Ok((f64::from(page.width().value), f64::from(page.height().value)))
        })
    }

    fn open_document(&self) -> Result<PdfDocument<'static>, ExtractionError> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .map_err(|err| {
                ExtractionError::DocumentClosed(format!(
                    "failed to reopen {:?}: {}",
                    self.path, err
                ))
            })?;
        // SAFETY: the returned PdfDocument borrows from the Pdfium bindings
        // owned by self.pdfium. The document is stored in self.document,
        // which is declared before self.pdfium, so struct fields dropping in
        // declaration order guarantees the document is gone before the
        // bindings it references.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R, ExtractionError>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R, ExtractionError>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.open_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }

    fn page<'a>(
        &self,
        document: &'a PdfDocument<'static>,
        page_number: usize,
    ) -> Result<PdfPage<'a>, ExtractionError> {
        let out_of_range = || ExtractionError::PageOutOfRange {
            page: page_number,
            page_count: self.page_count,
        };
        let page_index: PdfPageIndex = page_number.try_into().map_err(|_| out_of_range())?;
        document.pages().get(page_index).map_err(|_| out_of_range())
    }
}

impl CharacterExtractor for PdfiumTextDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn extract_page(&self, page_number: usize) -> Result<Vec<PageChar>, ExtractionError> {
        self.with_document(|document| {
            let page = self.page(document, page_number)?;
            let text = page.text().map_err(|err| {
                ExtractionError::Engine(format!(
                    "failed to load text for page {}: {}",
                    page_number, err
                ))
            })?;

            let mut characters = Vec::new();
            for ch in text.chars().iter() {
                let Some(scalar) = ch.unicode_char() else {
                    continue;
                };
                let bounds = match ch.loose_bounds() {
                    Ok(bounds) => bounds,
                    Err(err) => {
                        warn!(
                            page = page_number,
                            codepoint = scalar as u32,
                            error = %err,
                            "character without bounds; dropping it from the index"
                        );
                        continue;
                    }
                };
                characters.push(PageChar {
                    codepoint: scalar as u32,
                    index: characters.len(),
                    bounds: PageRect::new(
                        f64::from(bounds.left().value),
                        f64::from(bounds.bottom().value),
                        f64::from(bounds.right().value),
                        f64::from(bounds.top().value),
                    ),
                });
            }

            debug!(
                page = page_number,
                characters = characters.len(),
                "extracted page characters"
            );
            Ok(characters)
        })
    }
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var("PDFSIFT_PDFIUM_LIBRARY_PATH") {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(
                    "failed to load Pdfium from PDFSIFT_PDFIUM_LIBRARY_PATH {}: {}",
                    path, err
                );
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
