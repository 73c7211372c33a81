//! In-memory backend used by the sandbox tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pagebridge_core::{
    Affine, DocumentBackend, DocumentInfo, DocumentProvider, DocumentSource, PageSize, Rect,
    RenderImage, RenderRequest, TextRun,
};
use parking_lot::Mutex;
use uuid::Uuid;

pub const PAGE_SIZE: PageSize = PageSize {
    width: 380.0,
    height: 500.0,
};

/// Text box every fake page carries, in document space.
pub const TEXT_BOUNDS: Rect = Rect::new(10.0, 10.0, 100.0, 30.0);

#[derive(Default)]
pub struct FakeState {
    /// Held by a test to keep renders from completing.
    pub gate: Mutex<()>,
    pub rendered: Mutex<Vec<u32>>,
    pub failing: Mutex<HashSet<u32>>,
    pub opened: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn rendered(&self) -> Vec<u32> {
        self.rendered.lock().clone()
    }

    pub fn fail_page(&self, page: u32) {
        self.failing.lock().insert(page);
    }
}

pub struct FakeProvider {
    pub pages: usize,
    pub open_delay: Option<Duration>,
    pub state: Arc<FakeState>,
}

impl FakeProvider {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            open_delay: None,
            state: Arc::new(FakeState::default()),
        }
    }
}

#[async_trait]
impl DocumentProvider for FakeProvider {
    async fn open(&self, source: DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        let label = source.label();
        self.state.opened.lock().push(label.clone());
        Ok(Arc::new(FakeDocument {
            info: DocumentInfo {
                id: Uuid::new_v4(),
                label,
                page_count: self.pages,
                title: None,
            },
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct FakeDocument {
    info: DocumentInfo,
    state: Arc<FakeState>,
}

impl FakeDocument {
    fn check(&self, page_index: usize) -> Result<()> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("page {} out of range", page_index));
        }
        Ok(())
    }
}

impl DocumentBackend for FakeDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.check(page_index)?;
        Ok(PAGE_SIZE)
    }

    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.check(request.page_index)?;
        let _gate = self.state.gate.lock();
        let page = request.page_index as u32 + 1;
        self.state.rendered.lock().push(page);
        if self.state.failing.lock().contains(&page) {
            return Err(anyhow!("simulated failure on page {}", page));
        }
        Ok(RenderImage {
            width: 1,
            height: 1,
            pixels: vec![255, 255, 255, 255],
        })
    }

    fn text_runs(&self, page_index: usize) -> Result<Vec<TextRun>> {
        self.check(page_index)?;
        Ok(vec![TextRun {
            text: format!("Page {}", page_index + 1),
            bounds: TEXT_BOUNDS,
            transform: Affine::translate(TEXT_BOUNDS.left, TEXT_BOUNDS.bottom),
        }])
    }
}
