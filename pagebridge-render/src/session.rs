use std::sync::Arc;

use pagebridge_core::viewport::PageGeometry;
use pagebridge_core::{
    fit_to_width, hit_test, DocumentBackend, DocumentHandle, LayoutConfig, NavigationAction,
    NavigationCommand, Point, RenderImage, SandboxEvent, TextLayerItem, ViewportState,
    ZoomDirection, ZoomLimits,
};
use tracing::{debug, warn};

use crate::scheduler::{
    Finished, RenderError, RenderJob, RenderScheduler, RenderedPage, RequestOutcome,
};

const SCALE_EPSILON: f32 = 1e-4;

/// What is currently on the rendering surface.
#[derive(Debug, Clone)]
pub struct Frame {
    pub page: u32,
    pub image: RenderImage,
    pub geometry: PageGeometry,
    /// Top-left corner of the page inside the container.
    pub origin: Point,
    pub scale: f32,
}

/// Effects of a finished render that the event loop has to carry out.
#[derive(Debug, Default)]
pub struct Completed {
    pub event: Option<SandboxEvent>,
    pub frame: Option<Frame>,
    pub next: Option<RenderJob>,
}

/// All mutable state of one sandbox: the loaded document, the viewport, the
/// text layer of the displayed page and the scheduler that owns the surface.
pub struct SandboxSession {
    backend: Option<Arc<dyn DocumentBackend>>,
    document: Option<DocumentHandle>,
    viewport: ViewportState,
    limits: ZoomLimits,
    horizontal_padding: f32,
    fit_scale: f32,
    current_page: u32,
    text_layer: Vec<TextLayerItem>,
    frame_origin: Option<Point>,
    scheduler: RenderScheduler,
}

impl SandboxSession {
    pub fn new(layout: &LayoutConfig, limits: ZoomLimits) -> Self {
        let viewport = layout.viewport().with_scale(limits.clamp(1.0));
        Self {
            backend: None,
            document: None,
            viewport,
            limits,
            horizontal_padding: layout.horizontal_padding,
            fit_scale: viewport.scale,
            current_page: 0,
            text_layer: Vec::new(),
            frame_origin: None,
            scheduler: RenderScheduler::new(),
        }
    }

    /// Replaces the loaded document. The initial scale fits page 1 to the
    /// container width.
    pub fn install(&mut self, backend: Arc<dyn DocumentBackend>) -> DocumentHandle {
        let handle = DocumentHandle::from_info(backend.info());
        self.scheduler.reset();
        self.text_layer.clear();
        self.frame_origin = None;
        self.current_page = if handle.total_pages > 0 { 1 } else { 0 };

        let fitted = if handle.total_pages > 0 {
            match backend.page_size(0) {
                Ok(size) => {
                    fit_to_width(size.width, self.viewport.width_px, self.horizontal_padding)
                }
                Err(err) => {
                    warn!(error = %err, "could not measure first page, keeping default scale");
                    None
                }
            }
        } else {
            None
        };
        self.fit_scale = self.limits.clamp(fitted.unwrap_or(1.0));
        self.viewport.scale = self.fit_scale;

        self.backend = Some(backend);
        self.document = Some(handle);
        handle
    }

    pub fn document(&self) -> Option<&DocumentHandle> {
        self.document.as_ref()
    }

    pub fn backend(&self) -> Option<Arc<dyn DocumentBackend>> {
        self.backend.clone()
    }

    /// Last successfully rendered page, 0 when nothing is loaded.
    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn viewport(&self) -> &ViewportState {
        &self.viewport
    }

    pub fn limits(&self) -> &ZoomLimits {
        &self.limits
    }

    pub fn fit_scale(&self) -> f32 {
        self.fit_scale
    }

    pub fn text_layer(&self) -> &[TextLayerItem] {
        &self.text_layer
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    /// Page a navigation command points at. Relative moves start from the
    /// page the scheduler is heading to, so a burst of "next" calls advances
    /// once per call even before any of them has rendered.
    pub fn navigation_target(&self, command: &NavigationCommand) -> Option<i64> {
        let base = i64::from(self.scheduler.latest_target().unwrap_or(self.current_page));
        match command.action {
            NavigationAction::GoToPage => command.page_number,
            NavigationAction::GoToNextPage => Some(base + 1),
            NavigationAction::GoToPreviousPage => Some(base - 1),
        }
    }

    pub fn request_page(&mut self, page: i64) -> RequestOutcome {
        match &self.document {
            Some(document) => self.scheduler.request(page, self.viewport, document),
            None => RequestOutcome::Ignored,
        }
    }

    pub fn zoom(&mut self, direction: ZoomDirection) -> RequestOutcome {
        let scale = self.limits.apply(self.viewport.scale, direction);
        self.set_scale(scale)
    }

    /// Changes the scale and re-requests the page being shown (or about to
    /// be) under the new viewport.
    pub fn set_scale(&mut self, scale: f32) -> RequestOutcome {
        let scale = self.limits.clamp(scale);
        if (scale - self.viewport.scale).abs() < SCALE_EPSILON {
            return RequestOutcome::Ignored;
        }
        debug!(from = self.viewport.scale, to = scale, "zoom");
        self.viewport.scale = scale;

        let target = self.scheduler.latest_target().unwrap_or(self.current_page);
        if target == 0 {
            return RequestOutcome::Ignored;
        }
        self.request_page(i64::from(target))
    }

    pub fn complete(
        &mut self,
        job: &RenderJob,
        result: Result<RenderedPage, RenderError>,
    ) -> Completed {
        let next = match self.scheduler.finish(job.id) {
            Finished::Unknown => {
                debug!(page = job.requested_page, "discarding render for a replaced document");
                return Completed::default();
            }
            Finished::Superseded(next) => Some(next),
            Finished::Current => None,
        };

        match result {
            Ok(rendered) if next.is_none() => {
                let origin = job
                    .viewport
                    .page_origin(&rendered.geometry, self.horizontal_padding);
                self.current_page = job.requested_page;
                self.text_layer = rendered.text_layer;
                self.frame_origin = Some(origin);
                Completed {
                    event: Some(SandboxEvent::PageChanged {
                        current_page: job.requested_page,
                    }),
                    frame: Some(Frame {
                        page: job.requested_page,
                        image: rendered.image,
                        geometry: rendered.geometry,
                        origin,
                        scale: job.viewport.scale,
                    }),
                    next: None,
                }
            }
            Ok(_) => {
                debug!(page = job.requested_page, "discarding superseded render");
                Completed {
                    next,
                    ..Completed::default()
                }
            }
            Err(err) => {
                warn!(error = %err, "render failed");
                Completed {
                    event: Some(SandboxEvent::Error {
                        message: err.to_string(),
                    }),
                    frame: None,
                    next,
                }
            }
        }
    }

    /// Text item under a pointer given in container coordinates.
    pub fn hit_test(&self, pointer: Point) -> Option<&TextLayerItem> {
        let origin = self.frame_origin?;
        let on_page = self.viewport.pointer_to_page(pointer, origin);
        hit_test(on_page, &self.text_layer)
    }
}
