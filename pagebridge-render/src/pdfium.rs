use std::convert::TryFrom;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use pagebridge_core::{
    Affine, DocumentBackend, DocumentInfo, DocumentProvider, DocumentSource, PageSize, Rect,
    RenderImage, RenderRequest, TextRun,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Environment variable naming an explicit pdfium shared library.
pub const PDFIUM_LIBRARY_ENV: &str = "PAGEBRIDGE_PDFIUM_LIBRARY_PATH";

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, source: DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        let source = match source {
            DocumentSource::Path(path) => {
                let absolute = path
                    .canonicalize()
                    .with_context(|| format!("failed to resolve path for {:?}", path))?;
                PdfSource::Path(absolute)
            }
            DocumentSource::Bytes { label, data } => PdfSource::Bytes {
                label,
                data: Arc::new(data),
            },
        };
        let info = build_document_info(&self.pdfium, &source)?;
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            source,
            info,
        )))
    }
}

enum PdfSource {
    Path(PathBuf),
    Bytes { label: String, data: Arc<Vec<u8>> },
}

impl PdfSource {
    fn label(&self) -> String {
        match self {
            PdfSource::Path(path) => path.display().to_string(),
            PdfSource::Bytes { label, .. } => label.clone(),
        }
    }

    fn load<'a>(&self, pdfium: &'a Pdfium) -> Result<PdfDocument<'a>> {
        let document = match self {
            PdfSource::Path(path) => pdfium.load_pdf_from_file(path, None),
            PdfSource::Bytes { data, .. } => pdfium.load_pdf_from_byte_vec(data.as_ref().clone(), None),
        };
        document.with_context(|| format!("failed to open {}", self.label()))
    }
}

struct PdfiumDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    cache: Mutex<Option<RenderCacheEntry>>,
    info: DocumentInfo,
    source: PdfSource,
    pdfium: Arc<Pdfium>,
}

struct RenderCacheEntry {
    page_index: usize,
    scale: f32,
    image: RenderImage,
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, source: PdfSource, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            cache: Mutex::new(None),
            info,
            source,
            pdfium,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self.source.load(&self.pdfium)?;
        // SAFETY: the document borrows the bindings owned by self.pdfium. It is
        // stored in self.document, which is declared before self.pdfium and is
        // therefore dropped first, so the borrow never outlives the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            *guard = Some(self.open_document()?);
        }
        let document = guard
            .as_ref()
            .ok_or_else(|| anyhow!("document is not open"))?;
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        f(&page)
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.with_page(page_index, |page| {
            Ok(PageSize {
                width: page.width().value,
                height: page.height().value,
            })
        })
    }

    #[instrument(skip(self))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.as_ref() {
                if entry.page_index == request.page_index
                    && (entry.scale - request.scale).abs() < f32::EPSILON
                {
                    return Ok(entry.image.clone());
                }
            }
        }

        let image = self.with_page(request.page_index, |page| {
            let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_index))?;
            let pixels = bitmap.as_image().to_rgba8().into_raw();
            Ok(RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })?;

        *self.cache.lock() = Some(RenderCacheEntry {
            page_index: request.page_index,
            scale: request.scale,
            image: image.clone(),
        });

        Ok(image)
    }

    fn text_runs(&self, page_index: usize) -> Result<Vec<TextRun>> {
        self.with_page(page_index, |page| {
            let page_height = page.height().value;
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;

            let mut runs = Vec::new();
            for segment in text.segments().iter() {
                let content = segment.text();
                if content.trim().is_empty() {
                    continue;
                }
                // pdfium reports bottom-left origin rectangles
                let bounds = segment.bounds();
                let rect = Rect::new(
                    bounds.left().value,
                    page_height - bounds.top().value,
                    bounds.right().value,
                    page_height - bounds.bottom().value,
                );
                if !rect.is_valid() {
                    warn!(page = page_index, "skipping text segment with invalid bounds");
                    continue;
                }
                runs.push(TextRun {
                    text: content,
                    bounds: rect,
                    transform: Affine::translate(rect.left, rect.bottom),
                });
            }
            Ok(runs)
        })
    }
}

fn build_document_info(pdfium: &Pdfium, source: &PdfSource) -> Result<DocumentInfo> {
    let document = source.load(pdfium)?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let title = document
        .metadata()
        .get(PdfDocumentMetadataTagType::Title)
        .map(|tag| tag.value().to_owned())
        .filter(|title| !title.trim().is_empty());

    Ok(DocumentInfo {
        id: Uuid::new_v4(),
        label: source.label(),
        page_count,
        title,
    })
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = std::env::var(PDFIUM_LIBRARY_ENV).ok()?;
    if path.is_empty() {
        return None;
    }
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(%path, %err, "failed to load pdfium from {}", PDFIUM_LIBRARY_ENV);
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; install it or set {} ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}
